//! Bounded cache of recent maps and the incrementals between them.
//!
//! Full maps are kept only for some epochs; any retained epoch can be rebuilt
//! by replaying incrementals forward from the nearest older full map. The
//! trim horizon (`oldest`) never passes the newest epoch or the pinned
//! floor, which is the lowest epoch any local PG still refers to.

use super::osdmap::{Incremental, OsdMap};
use crate::error::MapError;
use crate::types::Epoch;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Default)]
struct CacheInner {
    maps: BTreeMap<Epoch, Arc<OsdMap>>,
    incrementals: BTreeMap<Epoch, Incremental>,
    oldest: Epoch,
    newest: Epoch,
    pinned_floor: Option<Epoch>,
}

/// Epoch cache.
#[derive(Debug)]
pub struct MapCache {
    inner: Mutex<CacheInner>,

    /// Number of epochs kept before `add_map` trims automatically.
    retention: usize,
}

impl MapCache {
    pub fn new(retention: usize) -> Self {
        Self {
            inner: Mutex::new(CacheInner::default()),
            retention: retention.max(2),
        }
    }

    /// Oldest retained epoch (0 when empty).
    pub fn oldest(&self) -> Epoch {
        self.inner.lock().oldest
    }

    /// Newest known epoch (0 when empty).
    pub fn newest(&self) -> Epoch {
        self.inner.lock().newest
    }

    /// Insert a full map. Epochs older than the retention window are trimmed.
    pub fn add_map(&self, map: Arc<OsdMap>) {
        let mut inner = self.inner.lock();
        let epoch = map.epoch;
        if inner.maps.is_empty() && inner.incrementals.is_empty() {
            inner.oldest = epoch;
        }
        inner.oldest = inner.oldest.min(epoch);
        inner.newest = inner.newest.max(epoch);
        inner.maps.insert(epoch, map);

        let span = (inner.newest - inner.oldest) as usize + 1;
        if span > self.retention {
            let horizon = inner.newest + 1 - self.retention as Epoch;
            Self::trim_locked(&mut inner, horizon);
        }
    }

    /// Insert the diff that produces `inc.epoch`.
    pub fn add_incremental(&self, inc: Incremental) {
        let mut inner = self.inner.lock();
        if inner.maps.is_empty() && inner.incrementals.is_empty() {
            inner.oldest = inc.epoch;
        }
        inner.newest = inner.newest.max(inc.epoch);
        inner.incrementals.insert(inc.epoch, inc);
    }

    /// The map at `epoch`, rebuilt from incrementals if only a diff is cached.
    pub fn get_map(&self, epoch: Epoch) -> Result<Arc<OsdMap>, MapError> {
        let mut inner = self.inner.lock();
        if let Some(map) = inner.maps.get(&epoch) {
            return Ok(map.clone());
        }
        if inner.newest == 0 || epoch > inner.newest {
            return Err(MapError::NotYetAvailable {
                epoch,
                newest: inner.newest,
            });
        }
        if epoch < inner.oldest {
            return Err(MapError::Trimmed {
                epoch,
                oldest: inner.oldest,
            });
        }

        let (&base_epoch, base) = inner
            .maps
            .range(..epoch)
            .next_back()
            .ok_or(MapError::Missing(epoch))?;
        let mut map = base.as_ref().clone();
        for e in base_epoch + 1..=epoch {
            let inc = inner.incrementals.get(&e).ok_or(MapError::Missing(e))?;
            map = map.apply_incremental(inc)?;
        }
        assert_eq!(map.epoch, epoch, "rebuilt map has the wrong epoch");

        let map = Arc::new(map);
        inner.maps.insert(epoch, map.clone());
        Ok(map)
    }

    /// Incrementals for `from + 1 ..= to`, in order.
    ///
    /// Fails with `MapError::Trimmed` when any diff in the range is gone; the
    /// caller then sends a full map instead.
    pub fn get_incremental(&self, from: Epoch, to: Epoch) -> Result<Vec<Incremental>, MapError> {
        let inner = self.inner.lock();
        if to > inner.newest {
            return Err(MapError::NotYetAvailable {
                epoch: to,
                newest: inner.newest,
            });
        }
        (from + 1..=to)
            .map(|e| {
                inner.incrementals.get(&e).cloned().ok_or(MapError::Trimmed {
                    epoch: e,
                    oldest: inner.oldest,
                })
            })
            .collect()
    }

    /// Forget epochs older than `oldest`. Returns the new horizon.
    ///
    /// The horizon is clamped to the newest epoch and the pinned floor. A
    /// full map is materialized at the horizon so later epochs stay
    /// reconstructible.
    pub fn trim(&self, oldest: Epoch) -> Epoch {
        let mut inner = self.inner.lock();
        Self::trim_locked(&mut inner, oldest)
    }

    /// Never trim past `floor`. `None` removes the pin.
    pub fn set_pinned_floor(&self, floor: Option<Epoch>) {
        self.inner.lock().pinned_floor = floor;
    }

    fn trim_locked(inner: &mut CacheInner, oldest: Epoch) -> Epoch {
        let mut horizon = oldest.min(inner.newest);
        if let Some(floor) = inner.pinned_floor {
            horizon = horizon.min(floor);
        }
        if horizon <= inner.oldest {
            return inner.oldest;
        }

        if !inner.maps.contains_key(&horizon) {
            let base = inner
                .maps
                .range(..horizon)
                .next_back()
                .map(|(e, m)| (*e, m.clone()));
            if let Some((base_epoch, base)) = base {
                let mut map = base.as_ref().clone();
                let mut ok = true;
                for e in base_epoch + 1..=horizon {
                    match inner.incrementals.get(&e).map(|inc| map.apply_incremental(inc)) {
                        Some(Ok(next)) => map = next,
                        _ => {
                            ok = false;
                            break;
                        }
                    }
                }
                if ok {
                    inner.maps.insert(horizon, Arc::new(map));
                }
            }
        }

        inner.maps = inner.maps.split_off(&horizon);
        inner.incrementals = inner.incrementals.split_off(&horizon);
        inner.oldest = horizon;
        tracing::debug!(oldest = horizon, newest = inner.newest, "trimmed map cache");
        horizon
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.lock();
        inner.maps.len().max(inner.incrementals.len())
    }

    pub fn is_empty(&self) -> bool {
        let inner = self.inner.lock();
        inner.maps.is_empty() && inner.incrementals.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::PoolInfo;

    /// Full map at epoch 1, then incrementals 2..=n each bumping up_thru.
    fn populated(n: Epoch, retention: usize) -> (MapCache, Vec<OsdMap>) {
        let cache = MapCache::new(retention);
        let mut inc = Incremental::new(1);
        inc.new_up = vec![0, 1, 2];
        inc.new_pools.push(PoolInfo::new(1, 4, 2));
        let mut map = OsdMap::new(uuid::Uuid::nil())
            .apply_incremental(&inc)
            .unwrap();
        let mut maps = vec![map.clone()];
        cache.add_map(Arc::new(map.clone()));

        for e in 2..=n {
            let mut inc = Incremental::new(e);
            inc.new_up_thru.insert(0, e);
            map = map.apply_incremental(&inc).unwrap();
            maps.push(map.clone());
            cache.add_incremental(inc);
        }
        (cache, maps)
    }

    #[test]
    fn test_add_then_get_round_trip() {
        let (cache, maps) = populated(1, 10);
        assert_eq!(*cache.get_map(1).unwrap(), maps[0]);
    }

    #[test]
    fn test_get_map_rebuilds_from_incrementals() {
        let (cache, maps) = populated(6, 10);
        let map = cache.get_map(5).unwrap();
        assert_eq!(map.epoch, 5);
        assert_eq!(*map, maps[4]);
        assert_eq!(map.up_thru(0), 5);
    }

    #[test]
    fn test_get_map_out_of_range() {
        let (cache, _) = populated(3, 10);
        assert_eq!(
            cache.get_map(9).unwrap_err(),
            MapError::NotYetAvailable { epoch: 9, newest: 3 }
        );
    }

    #[test]
    fn test_trim_then_get_fails() {
        let (cache, maps) = populated(8, 20);
        assert_eq!(cache.trim(5), 5);
        assert_eq!(cache.oldest(), 5);

        for e in 1..5 {
            assert!(matches!(
                cache.get_map(e),
                Err(MapError::Trimmed { oldest: 5, .. })
            ));
        }
        // Epochs at and after the horizon are still reconstructible.
        assert_eq!(*cache.get_map(7).unwrap(), maps[6]);
        assert_eq!(*cache.get_map(5).unwrap(), maps[4]);
    }

    #[test]
    fn test_trim_never_passes_newest_or_floor() {
        let (cache, _) = populated(6, 20);
        cache.set_pinned_floor(Some(3));
        assert_eq!(cache.trim(6), 3);
        assert!(cache.get_map(3).is_ok());

        cache.set_pinned_floor(None);
        assert_eq!(cache.trim(100), 6);
        assert!(cache.get_map(6).is_ok());
    }

    #[test]
    fn test_get_incremental_falls_back_when_trimmed() {
        let (cache, _) = populated(6, 20);
        let incs = cache.get_incremental(2, 6).unwrap();
        assert_eq!(incs.iter().map(|i| i.epoch).collect::<Vec<_>>(), vec![3, 4, 5, 6]);

        cache.trim(4);
        assert!(matches!(
            cache.get_incremental(2, 6),
            Err(MapError::Trimmed { epoch: 3, .. })
        ));
        assert!(cache.get_incremental(4, 6).is_ok());
    }

    #[test]
    fn test_add_map_retention() {
        let cache = MapCache::new(3);
        for e in 1..=5 {
            let mut map = OsdMap::new(uuid::Uuid::nil());
            map.epoch = e;
            cache.add_map(Arc::new(map));
        }
        assert_eq!(cache.oldest(), 3);
        assert!(cache.get_map(2).is_err());
        assert_eq!(cache.get_map(5).unwrap().epoch, 5);
    }
}
