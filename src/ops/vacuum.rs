//! Cluster-wide vacuum of volumes with too much garbage

use crate::common::{Result, VolumeId, VolumeSummary};
use crate::master::cluster::Master;
use crate::master::directory::VolumeLifecycle;
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct VacuumedVolume {
    pub volume_id: VolumeId,
    pub garbage_ratio: f64,
    pub reclaimed: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct VacuumReport {
    pub threshold: f64,
    pub vacuumed: Vec<VacuumedVolume>,
    pub failed: Vec<(VolumeId, String)>,
}

fn garbage_ratio(summary: &VolumeSummary) -> f64 {
    if summary.size == 0 {
        return 0.0;
    }
    summary.deleted_bytes as f64 / summary.size as f64
}

/// Volumes whose every replica is above `threshold`
pub fn vacuum_candidates(master: &Master, threshold: f64) -> Vec<(VolumeId, f64)> {
    let running = master.ec_jobs().running_jobs();
    master
        .topology()
        .reported_volumes()
        .into_iter()
        .filter(|(vid, _)| !running.contains(vid))
        .filter(|(vid, _)| {
            matches!(
                master.directory().lifecycle(*vid),
                Some(VolumeLifecycle::Writable | VolumeLifecycle::ReadOnly)
            )
        })
        .filter_map(|(vid, replicas)| {
            let ratio = replicas
                .iter()
                .map(garbage_ratio)
                .fold(f64::INFINITY, f64::min);
            (ratio.is_finite() && ratio > threshold).then_some((vid, ratio))
        })
        .collect()
}

/// Compact every replica of each candidate volume.
pub async fn vacuum_cluster(master: &Master, threshold: Option<f64>) -> Result<VacuumReport> {
    master.ensure_leader()?;
    let threshold = threshold.unwrap_or(master.config().garbage_threshold);
    tracing::info!("Starting cluster vacuum (threshold {:.2})", threshold);

    let mut report = VacuumReport {
        threshold,
        ..Default::default()
    };
    for (vid, ratio) in vacuum_candidates(master, threshold) {
        let mut reclaimed = 0;
        let mut failure = None;
        for location in master.topology().volume_locations(vid) {
            match master.admin().vacuum_volume(&location.url, vid).await {
                Ok(bytes) => reclaimed += bytes,
                Err(e) => {
                    tracing::warn!("Vacuum of volume {} on {} failed: {}", vid, location.url, e);
                    failure = Some(e.to_string());
                    break;
                }
            }
        }
        match failure {
            Some(error) => report.failed.push((vid, error)),
            None => {
                tracing::info!("Vacuumed volume {}, reclaimed {} bytes", vid, reclaimed);
                report.vacuumed.push(VacuumedVolume {
                    volume_id: vid,
                    garbage_ratio: ratio,
                    reclaimed,
                });
            }
        }
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_garbage_ratio() {
        let summary = VolumeSummary {
            id: 1,
            size: 1000,
            file_count: 10,
            delete_count: 4,
            deleted_bytes: 400,
            read_only: false,
            replication: "000".into(),
            compaction_revision: 0,
            max_needle_key: 10,
            modified_at: 0,
        };
        assert!((garbage_ratio(&summary) - 0.4).abs() < f64::EPSILON);
        assert_eq!(
            garbage_ratio(&VolumeSummary {
                size: 0,
                ..summary
            }),
            0.0
        );
    }
}
