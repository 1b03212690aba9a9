//! Replica and EC shard placement
//!
//! Volumes follow an `xyz` replica placement: x copies in other data
//! centers, y in other racks of the same data center, z on other servers of
//! the same rack. EC shards are spread over a fault domain instead. Both use
//! HRW (Highest Random Weight) ordering so the same inputs always give the
//! same answer.

use crate::common::{hrw_weight, Error, FaultDomain, Result, ShardId, VolumeId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

/// `xyz` replica placement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ReplicaPlacement {
    pub diff_data_center: u8,
    pub diff_rack: u8,
    pub same_rack: u8,
}

impl ReplicaPlacement {
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Ok(Self::default());
        }
        let digits: Vec<u8> = s
            .chars()
            .map(|c| c.to_digit(10).map(|d| d as u8))
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| Error::InvalidArgument(format!("invalid replication: {}", s)))?;
        if digits.len() != 3 {
            return Err(Error::InvalidArgument(format!(
                "replication must have three digits, got {}",
                s
            )));
        }
        let placement = Self {
            diff_data_center: digits[0],
            diff_rack: digits[1],
            same_rack: digits[2],
        };
        if placement.to_byte().is_none() {
            return Err(Error::InvalidArgument(format!("replication {} too large", s)));
        }
        Ok(placement)
    }

    /// Super block encoding, `x*100 + y*10 + z`
    pub fn to_byte(&self) -> Option<u8> {
        let value = self.diff_data_center as u16 * 100
            + self.diff_rack as u16 * 10
            + self.same_rack as u16;
        u8::try_from(value).ok()
    }

    pub fn from_byte(b: u8) -> Self {
        Self {
            diff_data_center: b / 100,
            diff_rack: (b % 100) / 10,
            same_rack: b % 10,
        }
    }

    pub fn copy_count(&self) -> usize {
        self.diff_data_center as usize + self.diff_rack as usize + self.same_rack as usize + 1
    }
}

impl fmt::Display for ReplicaPlacement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}{}",
            self.diff_data_center, self.diff_rack, self.same_rack
        )
    }
}

/// A live server as placement sees it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeCandidate {
    pub url: String,
    pub data_center: String,
    pub rack: String,
    pub free_slots: i64,
}

impl NodeCandidate {
    pub fn rack_key(&self) -> String {
        format!("{}/{}", self.data_center, self.rack)
    }
}

/// Most free slots first, HRW on ties
fn rank_servers(servers: &mut [&NodeCandidate], key: &str) {
    servers.sort_by(|a, b| {
        b.free_slots
            .cmp(&a.free_slots)
            .then_with(|| hrw_weight(key, &b.url).cmp(&hrw_weight(key, &a.url)))
    });
}

type RackMap<'a> = BTreeMap<String, Vec<&'a NodeCandidate>>;

fn group_by_dc<'a>(nodes: &[&'a NodeCandidate]) -> BTreeMap<String, RackMap<'a>> {
    let mut dcs: BTreeMap<String, RackMap<'a>> = BTreeMap::new();
    for node in nodes {
        dcs.entry(node.data_center.clone())
            .or_default()
            .entry(node.rack.clone())
            .or_default()
            .push(node);
    }
    dcs
}

fn rack_free(servers: &[&NodeCandidate]) -> i64 {
    servers.iter().map(|s| s.free_slots).sum()
}

/// Pick servers for a new volume replica set. The first entry is the main
/// replica, `same_rack` more share its rack, `diff_rack` sit on distinct
/// other racks of its data center and `diff_data_center` on distinct other
/// data centers.
pub fn select_volume_servers(
    placement: &ReplicaPlacement,
    nodes: &[NodeCandidate],
    key: &str,
    preferred_dc: Option<&str>,
) -> Result<Vec<NodeCandidate>> {
    let needed = placement.copy_count();
    let free: Vec<&NodeCandidate> = nodes.iter().filter(|n| n.free_slots > 0).collect();
    let dcs = group_by_dc(&free);

    let mut dc_order: Vec<&String> = dcs.keys().collect();
    dc_order.sort_by(|a, b| {
        let fa: i64 = dcs[*a].values().map(|r| rack_free(r)).sum();
        let fb: i64 = dcs[*b].values().map(|r| rack_free(r)).sum();
        fb.cmp(&fa)
            .then_with(|| hrw_weight(key, b).cmp(&hrw_weight(key, a)))
    });

    for main_dc in dc_order.iter().copied() {
        if let Some(dc) = preferred_dc {
            if dc != main_dc.as_str() {
                continue;
            }
        }
        let other_dcs: Vec<&String> = dc_order.iter().copied().filter(|d| *d != main_dc).collect();
        if other_dcs.len() < placement.diff_data_center as usize {
            continue;
        }

        let racks = &dcs[main_dc];
        let mut rack_order: Vec<&String> = racks.keys().collect();
        rack_order.sort_by(|a, b| {
            rack_free(&racks[*b])
                .cmp(&rack_free(&racks[*a]))
                .then_with(|| hrw_weight(key, b).cmp(&hrw_weight(key, a)))
        });

        for main_rack in rack_order.iter().copied() {
            let mut rack_servers = racks[main_rack].clone();
            if rack_servers.len() < placement.same_rack as usize + 1 {
                continue;
            }
            let other_racks: Vec<&String> =
                rack_order.iter().copied().filter(|r| *r != main_rack).collect();
            if other_racks.len() < placement.diff_rack as usize {
                continue;
            }

            rank_servers(&mut rack_servers, key);
            let mut chosen: Vec<NodeCandidate> = rack_servers
                .iter()
                .take(placement.same_rack as usize + 1)
                .map(|n| (*n).clone())
                .collect();

            for rack in other_racks.iter().take(placement.diff_rack as usize) {
                let mut servers = racks[*rack].clone();
                rank_servers(&mut servers, key);
                if let Some(server) = servers.first() {
                    chosen.push((*server).clone());
                }
            }

            for dc in other_dcs.iter().take(placement.diff_data_center as usize) {
                let mut servers: Vec<&NodeCandidate> =
                    dcs[*dc].values().flatten().copied().collect();
                rank_servers(&mut servers, key);
                if let Some(server) = servers.first() {
                    chosen.push((*server).clone());
                }
            }

            if chosen.len() == needed {
                return Ok(chosen);
            }
        }
    }

    Err(Error::InsufficientReplicas {
        needed,
        available: free.len(),
    })
}

/// Servers ordered so consecutive entries sit on different racks as long as
/// possible: one server from each rack in turn, racks and servers in HRW
/// order for `key`.
pub fn spread_order(nodes: &[NodeCandidate], key: &str) -> Vec<NodeCandidate> {
    let mut racks: HashMap<String, Vec<&NodeCandidate>> = HashMap::new();
    for node in nodes {
        racks.entry(node.rack_key()).or_default().push(node);
    }
    let mut rack_keys: Vec<String> = racks.keys().cloned().collect();
    rack_keys.sort_by(|a, b| {
        hrw_weight(key, b)
            .cmp(&hrw_weight(key, a))
            .then_with(|| a.cmp(b))
    });
    for servers in racks.values_mut() {
        servers.sort_by(|a, b| {
            hrw_weight(key, &b.url)
                .cmp(&hrw_weight(key, &a.url))
                .then_with(|| a.url.cmp(&b.url))
        });
    }

    let mut order = Vec::with_capacity(nodes.len());
    let mut round = 0;
    while order.len() < nodes.len() {
        for rack in &rack_keys {
            if let Some(server) = racks[rack].get(round) {
                order.push((*server).clone());
            }
        }
        round += 1;
    }
    order
}

fn distinct_racks(nodes: &[NodeCandidate]) -> usize {
    nodes.iter().map(|n| n.rack_key()).collect::<HashSet<_>>().len()
}

/// Assign `total` shards of a volume to servers. The result is indexed by
/// shard id.
pub fn plan_ec_shards(
    nodes: &[NodeCandidate],
    total: usize,
    domain: FaultDomain,
    volume_id: VolumeId,
) -> Result<Vec<NodeCandidate>> {
    let key = format!("ec-{}", volume_id);
    let order = spread_order(nodes, &key);

    match domain {
        FaultDomain::Rack => {
            let racks = distinct_racks(nodes);
            if racks < total {
                return Err(Error::PlacementInfeasible {
                    needed: total,
                    available: racks,
                });
            }
            // The first round of the spread order holds one server per rack
            Ok(order.into_iter().take(total).collect())
        }
        FaultDomain::Server => {
            if order.len() < total {
                return Err(Error::PlacementInfeasible {
                    needed: total,
                    available: order.len(),
                });
            }
            Ok(order.into_iter().take(total).collect())
        }
        FaultDomain::Any => {
            if order.is_empty() {
                return Err(Error::PlacementInfeasible {
                    needed: total,
                    available: 0,
                });
            }
            Ok((0..total).map(|i| order[i % order.len()].clone()).collect())
        }
    }
}

/// Pick homes for rebuilt shards. `occupied` lists surviving shard holders.
/// Tries the configured domain first and relaxes to distinct servers, then to
/// the least loaded server, so a rebuild is never refused for lack of racks.
pub fn plan_ec_replacements(
    nodes: &[NodeCandidate],
    domain: FaultDomain,
    volume_id: VolumeId,
    occupied: &[(ShardId, NodeCandidate)],
    missing: &[ShardId],
) -> Result<Vec<(ShardId, NodeCandidate)>> {
    if nodes.is_empty() {
        return Err(Error::PlacementInfeasible {
            needed: missing.len(),
            available: 0,
        });
    }
    let key = format!("ec-{}", volume_id);
    let order = spread_order(nodes, &key);

    let mut load: HashMap<String, usize> = HashMap::new();
    let mut used_racks: HashSet<String> = HashSet::new();
    for (_, node) in occupied {
        *load.entry(node.url.clone()).or_default() += 1;
        used_racks.insert(node.rack_key());
    }

    let mut plan = Vec::with_capacity(missing.len());
    for &shard in missing {
        let strict = order.iter().find(|n| {
            !load.contains_key(&n.url)
                && (domain != FaultDomain::Rack || !used_racks.contains(&n.rack_key()))
        });
        let server_only = || order.iter().find(|n| !load.contains_key(&n.url));
        let least_loaded = || {
            order
                .iter()
                .min_by_key(|n| load.get(&n.url).copied().unwrap_or_default())
        };

        let chosen = match strict {
            Some(n) => n,
            None => {
                let relaxed = server_only().or_else(least_loaded);
                match relaxed {
                    Some(n) => {
                        tracing::warn!(
                            "Placing rebuilt shard {} of volume {} on {} outside fault domain {:?}",
                            shard,
                            volume_id,
                            n.url,
                            domain
                        );
                        n
                    }
                    None => {
                        return Err(Error::PlacementInfeasible {
                            needed: missing.len(),
                            available: plan.len(),
                        })
                    }
                }
            }
        };
        *load.entry(chosen.url.clone()).or_default() += 1;
        used_racks.insert(chosen.rack_key());
        plan.push((shard, chosen.clone()));
    }
    Ok(plan)
}

/// Servers to receive extra replicas of a volume held by `holders`.
/// Racks the volume doesn't use yet come first, then free slots, HRW on ties.
pub fn select_repair_targets(
    nodes: &[NodeCandidate],
    holders: &[NodeCandidate],
    needed: usize,
    key: &str,
) -> Result<Vec<NodeCandidate>> {
    let mut used_racks: HashSet<String> = holders.iter().map(|h| h.rack_key()).collect();
    let mut pool: Vec<&NodeCandidate> = nodes
        .iter()
        .filter(|n| n.free_slots > 0 && !holders.iter().any(|h| h.url == n.url))
        .collect();
    let mut chosen = Vec::with_capacity(needed);
    while chosen.len() < needed {
        rank_servers(&mut pool, key);
        let pos = pool
            .iter()
            .position(|n| !used_racks.contains(&n.rack_key()))
            .or_else(|| (!pool.is_empty()).then_some(0));
        let Some(pos) = pos else {
            return Err(Error::InsufficientReplicas {
                needed: needed + holders.len(),
                available: chosen.len() + holders.len(),
            });
        };
        let node = pool.remove(pos);
        used_racks.insert(node.rack_key());
        chosen.push(node.clone());
    }
    Ok(chosen)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(dc: &str, rack: &str, n: usize, free: i64) -> NodeCandidate {
        NodeCandidate {
            url: format!("http://{}-{}-{}:8080", dc, rack, n),
            data_center: dc.into(),
            rack: rack.into(),
            free_slots: free,
        }
    }

    #[test]
    fn test_replica_placement_parse() {
        let rp = ReplicaPlacement::parse("012").unwrap();
        assert_eq!(rp.diff_rack, 1);
        assert_eq!(rp.same_rack, 2);
        assert_eq!(rp.copy_count(), 4);
        assert_eq!(rp.to_string(), "012");
        assert_eq!(ReplicaPlacement::from_byte(rp.to_byte().unwrap()), rp);
        assert_eq!(ReplicaPlacement::parse("").unwrap().copy_count(), 1);
        assert!(ReplicaPlacement::parse("01").is_err());
        assert!(ReplicaPlacement::parse("0a1").is_err());
        assert!(ReplicaPlacement::parse("900").is_err());
    }

    #[test]
    fn test_select_same_rack() {
        let nodes = vec![node("dc1", "r1", 1, 5), node("dc1", "r1", 2, 5), node("dc1", "r2", 1, 5)];
        let rp = ReplicaPlacement::parse("001").unwrap();
        let chosen = select_volume_servers(&rp, &nodes, "v", None).unwrap();
        assert_eq!(chosen.len(), 2);
        assert_eq!(chosen[0].rack, "r1");
        assert_eq!(chosen[1].rack, "r1");
        assert_ne!(chosen[0].url, chosen[1].url);
    }

    #[test]
    fn test_select_diff_rack_and_dc() {
        let nodes = vec![
            node("dc1", "r1", 1, 5),
            node("dc1", "r2", 1, 5),
            node("dc2", "r1", 1, 5),
        ];
        let rp = ReplicaPlacement::parse("110").unwrap();
        let chosen = select_volume_servers(&rp, &nodes, "v", Some("dc1")).unwrap();
        assert_eq!(chosen.len(), 3);
        assert_eq!(chosen[0].data_center, "dc1");
        assert_eq!(chosen[1].data_center, "dc1");
        assert_ne!(chosen[0].rack, chosen[1].rack);
        assert_eq!(chosen[2].data_center, "dc2");
    }

    #[test]
    fn test_select_insufficient() {
        let nodes = vec![node("dc1", "r1", 1, 5), node("dc1", "r1", 2, 0)];
        let rp = ReplicaPlacement::parse("001").unwrap();
        assert!(matches!(
            select_volume_servers(&rp, &nodes, "v", None),
            Err(Error::InsufficientReplicas {
                needed: 2,
                available: 1
            })
        ));
    }

    #[test]
    fn test_ec_rack_domain_distinct() {
        let nodes: Vec<_> = (0..14).map(|r| node("dc1", &format!("r{}", r), 1, 3)).collect();
        let plan = plan_ec_shards(&nodes, 14, FaultDomain::Rack, 7).unwrap();
        let racks: HashSet<_> = plan.iter().map(|n| n.rack_key()).collect();
        assert_eq!(racks.len(), 14);
        // Deterministic for a volume id
        assert_eq!(plan, plan_ec_shards(&nodes, 14, FaultDomain::Rack, 7).unwrap());
    }

    #[test]
    fn test_ec_any_domain_balanced() {
        let nodes: Vec<_> = (0..6).map(|r| node("dc1", &format!("r{}", r), 1, 3)).collect();
        let plan = plan_ec_shards(&nodes, 14, FaultDomain::Any, 1).unwrap();
        let mut per_server: HashMap<String, usize> = HashMap::new();
        for n in &plan {
            *per_server.entry(n.url.clone()).or_default() += 1;
        }
        assert_eq!(per_server.len(), 6);
        assert!(per_server.values().all(|&c| c <= 3));
    }

    #[test]
    fn test_ec_server_domain() {
        let nodes: Vec<_> = (0..4)
            .flat_map(|r| (0..4).map(move |s| node("dc1", &format!("r{}", r), s, 1)))
            .collect();
        let plan = plan_ec_shards(&nodes, 14, FaultDomain::Server, 3).unwrap();
        let servers: HashSet<_> = plan.iter().map(|n| n.url.clone()).collect();
        assert_eq!(servers.len(), 14);
        assert!(matches!(
            plan_ec_shards(&nodes[..10], 14, FaultDomain::Server, 3),
            Err(Error::PlacementInfeasible {
                needed: 14,
                available: 10
            })
        ));
    }

    #[test]
    fn test_replacements_avoid_occupied() {
        let nodes: Vec<_> = (0..5).map(|r| node("dc1", &format!("r{}", r), 1, 3)).collect();
        let occupied = vec![(0, nodes[0].clone()), (1, nodes[1].clone())];
        let plan = plan_ec_replacements(&nodes, FaultDomain::Rack, 1, &occupied, &[2, 3]).unwrap();
        assert_eq!(plan.len(), 2);
        for (_, n) in &plan {
            assert_ne!(n.url, nodes[0].url);
            assert_ne!(n.url, nodes[1].url);
        }
        assert_ne!(plan[0].1.url, plan[1].1.url);

        // Relaxes instead of refusing
        let plan = plan_ec_replacements(&nodes[..2], FaultDomain::Rack, 1, &occupied, &[2]).unwrap();
        assert_eq!(plan.len(), 1);
    }

    #[test]
    fn test_repair_targets_prefer_new_racks() {
        let holder = node("dc1", "r1", 1, 3);
        let nodes = vec![
            holder.clone(),
            node("dc1", "r1", 2, 9),
            node("dc1", "r2", 1, 2),
        ];
        let targets = select_repair_targets(&nodes, &[holder.clone()], 1, "v7").unwrap();
        assert_eq!(targets[0].rack, "r2");

        let two = select_repair_targets(&nodes, &[holder.clone()], 2, "v7").unwrap();
        assert_eq!(two.len(), 2);
        assert!(two.iter().all(|n| n.url != holder.url));

        assert!(matches!(
            select_repair_targets(&nodes, &[holder], 3, "v7"),
            Err(Error::InsufficientReplicas { .. })
        ));
    }
}
