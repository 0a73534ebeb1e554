//! The scored host directory.
//!
//! An ordered map keyed by enode id where every node carries a positive
//! evaluation. Selection draws without replacement, weighted by evaluation,
//! honoring an id blacklist and optionally a subnet blacklist (plus
//! subnet-uniqueness among the picks themselves).

use std::collections::BTreeMap;

use rand::Rng;
use thiserror::Error;

use common::{EnodeId, HostInfo};

use crate::ip::IpFilter;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TreeError {
    #[error("host already exists in the tree")]
    HostExists,
    #[error("host does not exist in the tree")]
    HostNotExists,
}

#[derive(Debug, Clone)]
struct HostNode {
    info: HostInfo,
    eval: u64,
}

/// Ordered, scored collection of hosts.
#[derive(Debug, Default)]
pub struct HostTree {
    nodes: BTreeMap<EnodeId, HostNode>,
}

impl HostTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, id: &EnodeId) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn insert(&mut self, info: HostInfo, eval: u64) -> Result<(), TreeError> {
        if self.nodes.contains_key(&info.enode_id) {
            return Err(TreeError::HostExists);
        }
        self.nodes.insert(
            info.enode_id,
            HostNode {
                info,
                eval: eval.max(1),
            },
        );
        Ok(())
    }

    pub fn remove(&mut self, id: &EnodeId) -> Result<(), TreeError> {
        self.nodes.remove(id).map(|_| ()).ok_or(TreeError::HostNotExists)
    }

    /// Replace a host's info and score in place.
    pub fn update(&mut self, info: HostInfo, eval: u64) -> Result<(), TreeError> {
        let node = self
            .nodes
            .get_mut(&info.enode_id)
            .ok_or(TreeError::HostNotExists)?;
        node.info = info;
        node.eval = eval.max(1);
        Ok(())
    }

    pub fn retrieve(&self, id: &EnodeId) -> Option<HostInfo> {
        self.nodes.get(id).map(|n| n.info.clone())
    }

    pub fn evaluation_of(&self, id: &EnodeId) -> Option<u64> {
        self.nodes.get(id).map(|n| n.eval)
    }

    pub fn all(&self) -> Vec<HostInfo> {
        self.nodes.values().map(|n| n.info.clone()).collect()
    }

    /// Weighted random selection of up to `n` hosts.
    ///
    /// `id_blacklist` entries never appear in the result. When
    /// `subnet_blacklist` is given, the subnets of those hosts are banned and
    /// every pick additionally claims its own subnet, so no two picks share
    /// one.
    pub fn select_random(
        &self,
        n: usize,
        id_blacklist: &[EnodeId],
        subnet_blacklist: Option<&[EnodeId]>,
    ) -> Vec<HostInfo> {
        let mut ip_filter = IpFilter::new();
        let subnet_check = subnet_blacklist.is_some();
        if let Some(banned) = subnet_blacklist {
            for id in banned {
                if let Some(node) = self.nodes.get(id) {
                    ip_filter.add(&node.info.ip);
                }
            }
        }

        let mut pool: Vec<&HostNode> = self
            .nodes
            .values()
            .filter(|node| !id_blacklist.contains(&node.info.enode_id))
            .collect();

        let mut rng = rand::rng();
        let mut picked = Vec::with_capacity(n);
        while picked.len() < n && !pool.is_empty() {
            let total: u128 = pool.iter().map(|node| node.eval as u128).sum();
            let mut roll = rng.random_range(0..total);
            let mut index = pool.len() - 1;
            for (i, node) in pool.iter().enumerate() {
                let weight = node.eval as u128;
                if roll < weight {
                    index = i;
                    break;
                }
                roll -= weight;
            }
            let node = pool.swap_remove(index);
            if subnet_check {
                if ip_filter.filtered(&node.info.ip) {
                    continue;
                }
                ip_filter.add(&node.info.ip);
            }
            picked.push(node.info.clone());
        }
        picked
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn host(byte: u8, ip: &str) -> HostInfo {
        HostInfo {
            enode_id: EnodeId::from_slice(&[byte; 32]),
            ip: ip.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn insert_remove_update() {
        let mut tree = HostTree::new();
        let h = host(1, "10.0.0.1");
        tree.insert(h.clone(), 10).unwrap();
        assert_eq!(tree.insert(h.clone(), 10), Err(TreeError::HostExists));
        assert_eq!(tree.evaluation_of(&h.enode_id), Some(10));

        let mut h2 = h.clone();
        h2.ip = "10.0.0.2".to_string();
        tree.update(h2.clone(), 20).unwrap();
        assert_eq!(tree.retrieve(&h.enode_id).unwrap().ip, "10.0.0.2");
        assert_eq!(tree.evaluation_of(&h.enode_id), Some(20));

        tree.remove(&h.enode_id).unwrap();
        assert_eq!(tree.remove(&h.enode_id), Err(TreeError::HostNotExists));
        assert_eq!(
            tree.update(h, 5).unwrap_err(),
            TreeError::HostNotExists
        );
    }

    #[test]
    fn zero_evaluation_is_clamped_to_one() {
        let mut tree = HostTree::new();
        tree.insert(host(1, "10.0.0.1"), 0).unwrap();
        assert_eq!(tree.evaluation_of(&EnodeId::from_slice(&[1; 32])), Some(1));
        // Selection over an all-zero-weight tree still terminates
        assert_eq!(tree.select_random(1, &[], None).len(), 1);
    }

    #[test]
    fn blacklisted_hosts_are_never_selected() {
        let mut tree = HostTree::new();
        for b in 1..=4u8 {
            tree.insert(host(b, &format!("10.0.{b}.1")), 100).unwrap();
        }
        let banned = EnodeId::from_slice(&[2; 32]);
        for _ in 0..20 {
            let picked = tree.select_random(4, &[banned], None);
            assert_eq!(picked.len(), 3);
            assert!(picked.iter().all(|h| h.enode_id != banned));
        }
    }

    #[test]
    fn selection_never_repeats_a_host() {
        let mut tree = HostTree::new();
        for b in 1..=5u8 {
            tree.insert(host(b, &format!("10.0.{b}.1")), b as u64 * 7).unwrap();
        }
        for _ in 0..20 {
            let picked = tree.select_random(5, &[], None);
            let unique: HashSet<_> = picked.iter().map(|h| h.enode_id).collect();
            assert_eq!(unique.len(), picked.len());
        }
    }

    #[test]
    fn subnet_blacklist_excludes_shared_networks() {
        let mut tree = HostTree::new();
        tree.insert(host(1, "10.0.1.1"), 100).unwrap();
        tree.insert(host(2, "10.0.1.2"), 100).unwrap(); // same /24 as host 1
        tree.insert(host(3, "10.0.3.1"), 100).unwrap();
        let banned = [EnodeId::from_slice(&[1; 32])];
        for _ in 0..20 {
            let picked = tree.select_random(3, &banned, Some(&banned));
            assert!(picked.iter().all(|h| h.enode_id != banned[0]));
            // Host 2 shares the banned subnet
            assert!(picked.iter().all(|h| h.enode_id != EnodeId::from_slice(&[2; 32])));
        }
    }

    #[test]
    fn picks_are_subnet_unique_when_filtering() {
        let mut tree = HostTree::new();
        tree.insert(host(1, "10.0.1.1"), 100).unwrap();
        tree.insert(host(2, "10.0.1.2"), 100).unwrap();
        tree.insert(host(3, "10.0.3.1"), 100).unwrap();
        for _ in 0..20 {
            let picked = tree.select_random(3, &[], Some(&[]));
            let subnets: HashSet<_> = picked
                .iter()
                .map(|h| crate::ip::subnet(&h.ip).unwrap())
                .collect();
            assert_eq!(subnets.len(), picked.len());
        }
    }
}
