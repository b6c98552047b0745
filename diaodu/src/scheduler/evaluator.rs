//! 候选父节点评分。评分器是可插拔能力，按配置的算法名构造，
//! 默认实现是一组亲和性指标的加权和。

use std::sync::Arc;

use tracing::warn;

use crate::resource::Registries;
use crate::resource::host::Host;
use crate::resource::peer::{Peer, PeerState};

/// 各项指标的权重，总和为 1
const PIECE_WEIGHT: f64 = 0.3;
const FREE_UPLOAD_WEIGHT: f64 = 0.25;
const HOST_TYPE_WEIGHT: f64 = 0.15;
const IDC_WEIGHT: f64 = 0.15;
const LOCATION_WEIGHT: f64 = 0.1;
const NET_TOPOLOGY_WEIGHT: f64 = 0.05;

/// 最近一次分片耗时超过这个下限（毫秒）才可能被判为坏节点
const BAD_NODE_COST_THRESHOLD_MS: u64 = 3000;

/// 最近一次耗时超过自身平均值的倍数
const BAD_NODE_COST_MULTIPLIER: u64 = 3;

/// 耗时样本不足时不做坏节点判定
const MIN_COST_SAMPLES: usize = 4;

pub trait Evaluator: Send + Sync {
    /// 候选父节点对 child 的适配程度，越大越好
    fn evaluate(&self, parent: &Arc<Peer>, child: &Arc<Peer>, total_piece_count: i32) -> f64;

    /// 是否是不该被选中的坏节点
    fn is_bad_node(&self, peer: &Arc<Peer>) -> bool;
}

/// 按算法名构造评分器。不认识的名字回退到 default
pub fn new_evaluator(algorithm: &str, registries: Arc<Registries>) -> Arc<dyn Evaluator> {
    match algorithm {
        "default" => Arc::new(DefaultEvaluator::new(registries)),
        other => {
            warn!("未知的评分算法 {other}，回退到 default");
            Arc::new(DefaultEvaluator::new(registries))
        }
    }
}

pub struct DefaultEvaluator {
    registries: Arc<Registries>,
}

impl DefaultEvaluator {
    pub fn new(registries: Arc<Registries>) -> Self {
        Self { registries }
    }

    fn host_of(&self, peer: &Peer) -> Option<Arc<Host>> {
        self.registries.hosts().get(peer.host_id())
    }

    /// 分片进度差，父节点领先越多越值得选
    fn piece_score(parent: &Peer, child: &Peer, total_piece_count: i32) -> f64 {
        let lead = parent.finished_count() - child.finished_count();
        if total_piece_count > 0 {
            (lead as f64 / total_piece_count as f64).clamp(0.0, 1.0)
        } else if lead > 0 {
            1.0
        } else {
            0.0
        }
    }

    fn free_upload_score(host: &Host) -> f64 {
        let limit = host.upload_limit();
        if limit == 0 {
            return 0.0;
        }
        host.free_upload_slots() as f64 / limit as f64
    }

    fn host_type_score(host: &Host) -> f64 {
        if host.is_seed() { 1.0 } else { 0.5 }
    }

    fn idc_score(a: &Host, b: &Host) -> f64 {
        if !a.idc().is_empty() && a.idc() == b.idc() {
            1.0
        } else {
            0.0
        }
    }

    /// | 分隔的逐级定位串，前缀匹配的层数越多越亲和
    fn affinity_score(a: &str, b: &str) -> f64 {
        if a.is_empty() || b.is_empty() {
            return 0.0;
        }
        let lhs: Vec<&str> = a.split('|').collect();
        let rhs: Vec<&str> = b.split('|').collect();
        let matched = lhs
            .iter()
            .zip(rhs.iter())
            .take_while(|(l, r)| l == r)
            .count();
        matched as f64 / lhs.len().max(rhs.len()) as f64
    }
}

impl Evaluator for DefaultEvaluator {
    fn evaluate(&self, parent: &Arc<Peer>, child: &Arc<Peer>, total_piece_count: i32) -> f64 {
        let (Some(parent_host), Some(child_host)) = (self.host_of(parent), self.host_of(child))
        else {
            return 0.0;
        };

        // 安全域不同的主机之间不互通
        if !parent_host.security_domain().is_empty()
            && !child_host.security_domain().is_empty()
            && parent_host.security_domain() != child_host.security_domain()
        {
            return 0.0;
        }

        PIECE_WEIGHT * Self::piece_score(parent, child, total_piece_count)
            + FREE_UPLOAD_WEIGHT * Self::free_upload_score(&parent_host)
            + HOST_TYPE_WEIGHT * Self::host_type_score(&parent_host)
            + IDC_WEIGHT * Self::idc_score(&parent_host, &child_host)
            + LOCATION_WEIGHT * Self::affinity_score(parent_host.location(), child_host.location())
            + NET_TOPOLOGY_WEIGHT
                * Self::affinity_score(parent_host.net_topology(), child_host.net_topology())
    }

    fn is_bad_node(&self, peer: &Arc<Peer>) -> bool {
        // 注意 Succeeded 不算坏节点，跑完的 peer 是最好的源
        if matches!(
            peer.state(),
            PeerState::Failed | PeerState::Leave | PeerState::Zombie
        ) {
            return true;
        }

        let (last, avg, samples) = peer.cost_stats();
        samples >= MIN_COST_SAMPLES
            && last > BAD_NODE_COST_THRESHOLD_MS
            && avg > 0
            && last > BAD_NODE_COST_MULTIPLIER * avg
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::protocol::{HostInfo, HostType, UrlMeta};
    use crate::resource::peer::PeerEvent;

    fn setup() -> Arc<Registries> {
        Arc::new(Registries::new(Config::new()))
    }

    fn add_host(r: &Registries, id: &str, host_type: HostType, idc: &str, location: &str) {
        r.hosts().upsert(&HostInfo {
            id: id.to_string(),
            ip: "127.0.0.1".to_string(),
            host_type,
            idc: idc.to_string(),
            location: location.to_string(),
            ..Default::default()
        });
    }

    fn add_peer(r: &Registries, peer_id: &str, host_id: &str) -> Arc<Peer> {
        let (task, _) = r.tasks().get_or_insert("t1", "http://x/1", &UrlMeta::default(), 3);
        let (peer, _) = r
            .peers()
            .get_or_insert(Peer::new(peer_id, "t1", host_id));
        task.add_peer(peer_id);
        peer
    }

    #[test]
    fn test_seed_beats_client() {
        let r = setup();
        add_host(&r, "seed", HostType::SuperSeed, "", "");
        add_host(&r, "client", HostType::Client, "", "");
        add_host(&r, "child-host", HostType::Client, "", "");

        let seed = add_peer(&r, "p-seed", "seed");
        let client = add_peer(&r, "p-client", "client");
        let child = add_peer(&r, "p-child", "child-host");

        let evaluator = DefaultEvaluator::new(r.clone());
        assert!(evaluator.evaluate(&seed, &child, 0) > evaluator.evaluate(&client, &child, 0));
    }

    #[test]
    fn test_idc_affinity() {
        let r = setup();
        add_host(&r, "near", HostType::Client, "idc-a", "");
        add_host(&r, "far", HostType::Client, "idc-b", "");
        add_host(&r, "child-host", HostType::Client, "idc-a", "");

        let near = add_peer(&r, "p-near", "near");
        let far = add_peer(&r, "p-far", "far");
        let child = add_peer(&r, "p-child", "child-host");

        let evaluator = DefaultEvaluator::new(r.clone());
        assert!(evaluator.evaluate(&near, &child, 0) > evaluator.evaluate(&far, &child, 0));
    }

    #[test]
    fn test_security_domain_blocks() {
        let r = setup();
        r.hosts().upsert(&HostInfo {
            id: "a".to_string(),
            security_domain: "dmz".to_string(),
            ..Default::default()
        });
        r.hosts().upsert(&HostInfo {
            id: "b".to_string(),
            security_domain: "intranet".to_string(),
            ..Default::default()
        });
        let parent = add_peer(&r, "p-a", "a");
        let child = add_peer(&r, "p-b", "b");

        let evaluator = DefaultEvaluator::new(r.clone());
        assert_eq!(evaluator.evaluate(&parent, &child, 0), 0.0);
    }

    #[test]
    fn test_affinity_score() {
        assert_eq!(DefaultEvaluator::affinity_score("", "cn|hz"), 0.0);
        assert_eq!(DefaultEvaluator::affinity_score("cn|hz", "cn|hz"), 1.0);
        assert_eq!(DefaultEvaluator::affinity_score("cn|hz|az1", "cn|hz|az2"), 2.0 / 3.0);
        assert_eq!(DefaultEvaluator::affinity_score("cn|hz", "us|ca"), 0.0);
    }

    #[test]
    fn test_bad_node_by_state() {
        let r = setup();
        add_host(&r, "h", HostType::Client, "", "");
        let peer = add_peer(&r, "p1", "h");
        let evaluator = DefaultEvaluator::new(r.clone());

        assert!(!evaluator.is_bad_node(&peer));
        peer.transit(PeerEvent::DownloadFailed).unwrap();
        assert!(evaluator.is_bad_node(&peer));

        // 下载完成的 peer 是最好的源，不是坏节点
        let done = add_peer(&r, "p2", "h");
        done.transit(PeerEvent::RegisterNormal).unwrap();
        done.transit(PeerEvent::Download).unwrap();
        done.transit(PeerEvent::DownloadSucceeded).unwrap();
        assert!(!evaluator.is_bad_node(&done));
    }

    #[test]
    fn test_bad_node_by_cost() {
        let r = setup();
        add_host(&r, "h", HostType::Client, "", "");
        let peer = add_peer(&r, "p1", "h");
        let evaluator = DefaultEvaluator::new(r.clone());

        // 平稳的耗时不算坏
        for i in 0..4 {
            peer.update_progress(i, i as i32 + 1, 100);
        }
        assert!(!evaluator.is_bad_node(&peer));

        // 突然飙高才算
        peer.update_progress(4, 5, 10_000);
        assert!(evaluator.is_bad_node(&peer));
    }
}
