use mintwatch_core_types::{ratio_for_wire, Alert};
use serde_json::{json, Value};

fn short_mint(mint: &str) -> &str {
    if mint.len() > 8 {
        &mint[..8]
    } else {
        mint
    }
}

fn ratio_label(ratio: f64) -> String {
    if ratio.is_infinite() {
        "∞ (no sells)".to_string()
    } else {
        format!("{ratio:.1}x")
    }
}

fn risk_label(score: f64) -> &'static str {
    if score >= 0.7 {
        "HIGH"
    } else if score >= 0.4 {
        "MEDIUM"
    } else if score >= 0.2 {
        "LOW"
    } else {
        "MINIMAL"
    }
}

/// Discord webhook payload: one embed per alert, formatted exactly once.
pub fn discord_payload(alert: &Alert) -> Value {
    let title = match (&alert.token_symbol, &alert.token_name) {
        (Some(symbol), Some(name)) => format!("{symbol} — {name}"),
        (Some(symbol), None) => symbol.clone(),
        (None, Some(name)) => name.clone(),
        (None, None) => short_mint(&alert.mint).to_string(),
    };

    let mut fields = vec![
        json!({"name": "Trigger", "value": alert.trigger_name, "inline": true}),
        json!({"name": "Venue", "value": alert.venue.clone().unwrap_or_else(|| "unknown".to_string()), "inline": true}),
        json!({"name": "CTO risk", "value": format!("{} ({:.0}%)", risk_label(alert.cto_score), alert.cto_score * 100.0), "inline": true}),
        json!({"name": "Buys (5m)", "value": alert.buy_count_5m.to_string(), "inline": true}),
        json!({"name": "Unique buyers (5m)", "value": alert.unique_buyers_5m.to_string(), "inline": true}),
        json!({"name": "Volume (5m)", "value": format!("{:.2} SOL", alert.volume_sol_5m), "inline": true}),
        json!({"name": "Buy/sell", "value": ratio_label(alert.buy_sell_ratio_5m), "inline": true}),
    ];
    if let Some(mcap) = alert.mcap_sol {
        fields.push(json!({"name": "Mcap", "value": format!("{mcap:.0} SOL"), "inline": true}));
    }
    if !alert.clusters.is_empty() {
        let summary = alert
            .clusters
            .iter()
            .take(3)
            .map(|cluster| {
                format!(
                    "{} wallets / {:.2} SOL",
                    cluster.size, cluster.volume_sol
                )
            })
            .collect::<Vec<_>>()
            .join(", ");
        fields.push(json!({"name": "Clusters", "value": summary, "inline": false}));
    }
    if !alert.cto_components.evidence.is_empty() {
        fields.push(json!({
            "name": "Evidence",
            "value": alert.cto_components.evidence.join("\n"),
            "inline": false
        }));
    }

    let mut embed = json!({
        "title": title,
        "description": format!("`{}`\n{}", alert.mint, alert.trigger_reason),
        "fields": fields,
        "timestamp": alert.created_at.to_rfc3339(),
    });
    if let Some(image) = &alert.token_image {
        embed["thumbnail"] = json!({"url": image});
    }
    if alert.enrichment_degraded {
        embed["footer"] = json!({"text": "enrichment degraded — partial data"});
    }

    json!({"embeds": [embed]})
}

/// Telegram `sendMessage` payload with HTML formatting.
pub fn telegram_payload(alert: &Alert, chat_id: &str) -> Value {
    let symbol = alert
        .token_symbol
        .clone()
        .unwrap_or_else(|| short_mint(&alert.mint).to_string());
    let mut lines = vec![
        format!("<b>{symbol}</b> fired <b>{}</b>", alert.trigger_name),
        format!("<code>{}</code>", alert.mint),
        format!(
            "buys {} | buyers {} | volume {:.2} SOL | ratio {}",
            alert.buy_count_5m,
            alert.unique_buyers_5m,
            alert.volume_sol_5m,
            ratio_label(alert.buy_sell_ratio_5m)
        ),
        format!(
            "CTO {} ({:.0}%)",
            risk_label(alert.cto_score),
            alert.cto_score * 100.0
        ),
    ];
    if let Some(mcap) = alert.mcap_sol {
        lines.push(format!("mcap {mcap:.0} SOL"));
    }
    if alert.enrichment_degraded {
        lines.push("<i>enrichment degraded</i>".to_string());
    }

    json!({
        "chat_id": chat_id,
        "text": lines.join("\n"),
        "parse_mode": "HTML",
        "disable_web_page_preview": true,
    })
}

/// Canonical JSON wire form for the append sink and any generic webhook.
pub fn sink_payload(alert: &Alert) -> Value {
    let mut value = serde_json::to_value(alert).unwrap_or_else(|_| json!({}));
    if let Some(object) = value.as_object_mut() {
        object.insert(
            "buy_sell_ratio_5m".to_string(),
            json!(ratio_for_wire(alert.buy_sell_ratio_5m)),
        );
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use mintwatch_core_types::{ClusterSummary, CtoScore, RATIO_INF_SENTINEL};
    use uuid::Uuid;

    fn alert() -> Alert {
        Alert {
            id: Uuid::new_v4(),
            mint: "MintMMMMMMMMMMMMMMMMMMMM".to_string(),
            token_symbol: Some("TKN".to_string()),
            token_name: Some("Token".to_string()),
            token_image: None,
            trigger_name: "extreme_ratio_5m".to_string(),
            trigger_reason: "Trigger: extreme_ratio_5m | buy_count_5m=12.00 (>= 10)".to_string(),
            venue: Some("pump".to_string()),
            volume_sol_5m: 4.2,
            buy_count_5m: 12,
            sell_count_5m: 0,
            unique_buyers_5m: 5,
            buy_sell_ratio_5m: f64::INFINITY,
            mcap_sol: Some(1_234.0),
            avg_entry_mcap: None,
            cto_score: 0.72,
            cto_components: CtoScore::default(),
            top_buyers: vec![("walletA".to_string(), 2.0)],
            clusters: vec![ClusterSummary {
                cluster_id: "walletA".to_string(),
                size: 3,
                volume_sol: 3.3,
            }],
            enrichment_degraded: false,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn discord_payload_carries_embed_fields() {
        let payload = discord_payload(&alert());
        let embed = &payload["embeds"][0];
        assert_eq!(embed["title"], "TKN — Token");
        assert!(embed["description"]
            .as_str()
            .expect("description")
            .contains("MintMMMM"));
        let fields = embed["fields"].as_array().expect("fields");
        assert!(fields.iter().any(|field| field["name"] == "Buy/sell"
            && field["value"].as_str().expect("value").contains('∞')));
    }

    #[test]
    fn telegram_payload_targets_the_chat() {
        let payload = telegram_payload(&alert(), "-100123");
        assert_eq!(payload["chat_id"], "-100123");
        assert_eq!(payload["parse_mode"], "HTML");
        assert!(payload["text"].as_str().expect("text").contains("TKN"));
    }

    #[test]
    fn sink_payload_replaces_infinite_ratio_with_sentinel() {
        let payload = sink_payload(&alert());
        assert_eq!(
            payload["buy_sell_ratio_5m"].as_f64().expect("ratio"),
            RATIO_INF_SENTINEL
        );
    }

    #[test]
    fn risk_labels_follow_score_bands() {
        assert_eq!(risk_label(0.9), "HIGH");
        assert_eq!(risk_label(0.5), "MEDIUM");
        assert_eq!(risk_label(0.25), "LOW");
        assert_eq!(risk_label(0.05), "MINIMAL");
    }
}
