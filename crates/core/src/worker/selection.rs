//! Worker selection over registry snapshots.

use super::types::{HardwareAccel, Liveness, WorkerClass, WorkerPreference, WorkerRecord};

/// Pick the worker an Encode dispatch should go to.
///
/// Only online workers with spare capacity and the required capability are
/// eligible. Within a class the least-loaded worker wins, ties broken by id.
pub fn select_candidate<'a>(
    workers: &'a [WorkerRecord],
    preference: WorkerPreference,
    required: Option<HardwareAccel>,
) -> Option<&'a WorkerRecord> {
    let eligible = |w: &&WorkerRecord| {
        w.liveness == Liveness::Online
            && w.has_capacity()
            && required.map_or(true, |accel| w.supports(accel))
    };
    let least_loaded = |class: Option<WorkerClass>| {
        workers
            .iter()
            .filter(eligible)
            .filter(|w| class.map_or(true, |c| w.class == c))
            .min_by(|a, b| {
                a.current_load
                    .cmp(&b.current_load)
                    .then_with(|| a.id.cmp(&b.id))
            })
    };

    match preference {
        WorkerPreference::PreferRemote => least_loaded(Some(WorkerClass::Remote))
            .or_else(|| least_loaded(Some(WorkerClass::Local))),
        WorkerPreference::RemoteOnly => least_loaded(Some(WorkerClass::Remote)),
        WorkerPreference::ServerOnly => least_loaded(Some(WorkerClass::Local)),
        WorkerPreference::LoadBalance => least_loaded(None),
    }
}
