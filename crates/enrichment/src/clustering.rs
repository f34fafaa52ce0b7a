use mintwatch_core_types::ClusterSummary;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::debug;

/// Disjoint-set over wallet addresses, union by rank with path compression.
struct UnionFind {
    parent: HashMap<String, String>,
    rank: HashMap<String, u32>,
}

impl UnionFind {
    fn new() -> Self {
        Self {
            parent: HashMap::new(),
            rank: HashMap::new(),
        }
    }

    fn find(&mut self, node: &str) -> String {
        if !self.parent.contains_key(node) {
            self.parent.insert(node.to_string(), node.to_string());
            self.rank.insert(node.to_string(), 0);
            return node.to_string();
        }

        // Walk to the root, then compress the visited chain.
        let mut root = node.to_string();
        loop {
            let parent = self.parent[&root].clone();
            if parent == root {
                break;
            }
            root = parent;
        }
        let mut current = node.to_string();
        while current != root {
            let next = self.parent[&current].clone();
            self.parent.insert(current, root.clone());
            current = next;
        }
        root
    }

    fn union(&mut self, a: &str, b: &str) -> String {
        let root_a = self.find(a);
        let root_b = self.find(b);
        if root_a == root_b {
            return root_a;
        }

        let rank_a = self.rank[&root_a];
        let rank_b = self.rank[&root_b];
        if rank_a < rank_b {
            self.parent.insert(root_a, root_b.clone());
            root_b
        } else if rank_a > rank_b {
            self.parent.insert(root_b, root_a.clone());
            root_a
        } else {
            self.parent.insert(root_b, root_a.clone());
            self.rank.insert(root_a.clone(), rank_a + 1);
            root_a
        }
    }
}

struct ClusterData {
    union_find: UnionFind,
    buy_volume: HashMap<String, f64>,
}

/// Wallet clustering over the funded-by relation. Single exclusive lock:
/// unions only ever come from the enrichment worker, lookups are short, so
/// union/find stay strictly serializable without finer-grained tricks.
pub struct WalletClusterer {
    inner: Mutex<ClusterData>,
}

impl Default for WalletClusterer {
    fn default() -> Self {
        Self::new()
    }
}

impl WalletClusterer {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(ClusterData {
                union_find: UnionFind::new(),
                buy_volume: HashMap::new(),
            }),
        }
    }

    pub fn note_buy(&self, wallet: &str, volume_sol: f64) {
        let mut inner = self.lock();
        inner.union_find.find(wallet);
        *inner.buy_volume.entry(wallet.to_string()).or_default() += volume_sol;
    }

    /// Wallet A's first inbound native transfer came from B: same cluster.
    pub fn link_funding(&self, wallet: &str, funder: &str) {
        let mut inner = self.lock();
        inner.union_find.find(wallet);
        inner.union_find.find(funder);
        let root = inner.union_find.union(wallet, funder);
        debug!(wallet, funder, root = %root, "wallets linked by funding");
    }

    pub fn cluster_id(&self, wallet: &str) -> String {
        self.lock().union_find.find(wallet)
    }

    /// Clusters represented among `wallets`, deduped by root, with the
    /// cluster-wide buy volume summed over every tracked member.
    pub fn clusters_for(&self, wallets: &[String]) -> Vec<ClusterSummary> {
        let mut inner = self.lock();

        let mut members_by_root: HashMap<String, Vec<String>> = HashMap::new();
        let tracked: Vec<String> = inner.union_find.parent.keys().cloned().collect();
        for wallet in tracked {
            let root = inner.union_find.find(&wallet);
            members_by_root.entry(root).or_default().push(wallet);
        }

        let mut seen_roots = Vec::new();
        let mut out = Vec::new();
        for wallet in wallets {
            let root = inner.union_find.find(wallet);
            if seen_roots.contains(&root) {
                continue;
            }
            seen_roots.push(root.clone());

            let members = members_by_root
                .get(&root)
                .cloned()
                .unwrap_or_else(|| vec![wallet.clone()]);
            let volume_sol = members
                .iter()
                .map(|member| inner.buy_volume.get(member).copied().unwrap_or(0.0))
                .sum();
            out.push(ClusterSummary {
                cluster_id: root,
                size: members.len(),
                volume_sol,
            });
        }
        out.sort_by(|a, b| {
            b.volume_sol
                .partial_cmp(&a.volume_sol)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        out
    }

    /// Largest single-cluster share of the given buyers' total volume; the
    /// `cluster` component of the coordination score.
    pub fn max_cluster_share(&self, buyers: &[(String, f64)]) -> f64 {
        if buyers.is_empty() {
            return 0.0;
        }
        let total: f64 = buyers.iter().map(|(_, volume)| volume).sum();
        if total <= 0.0 {
            return 0.0;
        }

        let mut inner = self.lock();
        let mut volume_by_root: HashMap<String, f64> = HashMap::new();
        for (wallet, volume) in buyers {
            let root = inner.union_find.find(wallet);
            *volume_by_root.entry(root).or_default() += volume;
        }
        let max = volume_by_root.values().copied().fold(0.0f64, f64::max);
        (max / total).min(1.0)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ClusterData> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn funding_links_merge_clusters_transitively() {
        let clusterer = WalletClusterer::new();
        clusterer.link_funding("walletA", "funder1");
        clusterer.link_funding("walletB", "funder1");
        clusterer.link_funding("walletC", "walletB");

        let root = clusterer.cluster_id("walletA");
        assert_eq!(clusterer.cluster_id("walletC"), root);
        assert_ne!(clusterer.cluster_id("loner"), root);
    }

    #[test]
    fn cluster_share_reflects_linked_buyer_volume() {
        let clusterer = WalletClusterer::new();
        clusterer.link_funding("walletA", "walletB");

        let buyers = vec![
            ("walletA".to_string(), 6.0),
            ("walletB".to_string(), 2.0),
            ("walletC".to_string(), 2.0),
        ];
        let share = clusterer.max_cluster_share(&buyers);
        assert!((share - 0.8).abs() < 1e-9, "share {share}");
    }

    #[test]
    fn unlinked_buyers_yield_the_largest_single_share() {
        let clusterer = WalletClusterer::new();
        let buyers = vec![
            ("walletA".to_string(), 5.0),
            ("walletB".to_string(), 3.0),
            ("walletC".to_string(), 2.0),
        ];
        let share = clusterer.max_cluster_share(&buyers);
        assert!((share - 0.5).abs() < 1e-9);
    }

    #[test]
    fn clusters_for_dedupes_by_root_and_sums_volume() {
        let clusterer = WalletClusterer::new();
        clusterer.note_buy("walletA", 4.0);
        clusterer.note_buy("walletB", 1.0);
        clusterer.link_funding("walletA", "walletB");
        clusterer.note_buy("walletC", 2.0);

        let clusters = clusterer.clusters_for(&[
            "walletA".to_string(),
            "walletB".to_string(),
            "walletC".to_string(),
        ]);
        assert_eq!(clusters.len(), 2);
        assert_eq!(clusters[0].size, 2);
        assert!((clusters[0].volume_sol - 5.0).abs() < 1e-9);
        assert_eq!(clusters[1].size, 1);
    }

    #[test]
    fn empty_buyers_score_zero_share() {
        let clusterer = WalletClusterer::new();
        assert_eq!(clusterer.max_cluster_share(&[]), 0.0);
    }
}
