use std::{collections::BTreeSet, sync::Arc};

use rand::Rng;
use tokio::sync::{Mutex, MutexGuard};

use crate::error::{HiveError, HiveResult};
use crate::records::{InstanceRecord, RecordState, RecordStore};

pub const PORT_MIN: u32 = 1024;
pub const PORT_MAX: u32 = 65535;

/// Inclusive range. Kept as `u32` so out-of-bounds config survives parsing and
/// is skipped rather than rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PortRange {
    pub start: u32,
    pub end: u32,
}

impl PortRange {
    pub fn is_valid(&self) -> bool {
        self.start >= PORT_MIN && self.end <= PORT_MAX && self.start <= self.end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortAssignment {
    /// Lowest free port.
    #[default]
    Sequential,
    /// Uniform pick from the free set.
    Random,
}

impl std::str::FromStr for PortAssignment {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sequential" => Ok(PortAssignment::Sequential),
            "random" => Ok(PortAssignment::Random),
            other => anyhow::bail!("unknown port assignment policy: {other}"),
        }
    }
}

pub fn port_pool(ranges: &[PortRange]) -> BTreeSet<u16> {
    let mut out = BTreeSet::new();
    for r in ranges {
        if !r.is_valid() {
            tracing::debug!(start = r.start, end = r.end, "skipping invalid port range");
            continue;
        }
        // is_valid() bounds both ends to u16.
        out.extend((r.start..=r.end).map(|p| p as u16));
    }
    out
}

/// Ports claimed by every record that is neither draft nor trashed.
pub fn active_ports(records: &[InstanceRecord]) -> BTreeSet<u16> {
    records
        .iter()
        .filter(|r| !matches!(r.state, RecordState::Draft | RecordState::Trashed))
        .flat_map(InstanceRecord::claimed_ports)
        .collect()
}

pub fn available_ports(ranges: &[PortRange], records: &[InstanceRecord]) -> BTreeSet<u16> {
    let active = active_ports(records);
    port_pool(ranges)
        .into_iter()
        .filter(|p| !active.contains(p))
        .collect()
}

/// Stateless allocator; recomputes availability from the record store on every
/// session, under one process-wide lock.
pub struct PortAllocator {
    ranges: Vec<PortRange>,
    policy: PortAssignment,
    store: Arc<dyn RecordStore>,
    lock: Mutex<()>,
}

impl PortAllocator {
    pub fn new(ranges: Vec<PortRange>, policy: PortAssignment, store: Arc<dyn RecordStore>) -> Self {
        Self {
            ranges,
            policy,
            store,
            lock: Mutex::new(()),
        }
    }

    fn compute_available(&self) -> HiveResult<BTreeSet<u16>> {
        let records = self.store.list().map_err(HiveError::Store)?;
        Ok(available_ports(&self.ranges, &records))
    }

    /// Snapshot for reporting. Not a reservation.
    pub async fn available_ports(&self) -> HiveResult<BTreeSet<u16>> {
        let _g = self.lock.lock().await;
        self.compute_available()
    }

    /// Opens an allocation session. Callers must persist the ports they take
    /// before dropping the session.
    pub async fn session(&self) -> HiveResult<AllocationSession<'_>> {
        let guard = self.lock.lock().await;
        let free = self.compute_available()?;
        Ok(AllocationSession {
            _guard: guard,
            free,
            policy: self.policy,
        })
    }
}

pub struct AllocationSession<'a> {
    _guard: MutexGuard<'a, ()>,
    free: BTreeSet<u16>,
    policy: PortAssignment,
}

impl AllocationSession<'_> {
    pub fn remaining(&self) -> usize {
        self.free.len()
    }

    pub fn request_port(&mut self) -> HiveResult<u16> {
        let port = match self.policy {
            PortAssignment::Sequential => self.free.first().copied(),
            PortAssignment::Random => {
                if self.free.is_empty() {
                    None
                } else {
                    let idx = rand::thread_rng().gen_range(0..self.free.len());
                    self.free.iter().nth(idx).copied()
                }
            }
        }
        .ok_or(HiveError::ResourceExhausted)?;
        self.free.remove(&port);
        Ok(port)
    }
}

#[cfg(test)]
mod tests {
    use hive_process::InstanceId;

    use super::*;
    use crate::records::{MemoryRecordStore, RecordField};

    fn record(id: &str, v4: u16, v6: u16) -> InstanceRecord {
        let mut r = InstanceRecord::new(InstanceId::parse(id).unwrap(), id);
        r.port_v4 = Some(v4);
        r.port_v6 = Some(v6);
        r
    }

    #[test]
    fn invalid_ranges_are_skipped() {
        let pool = port_pool(&[
            PortRange { start: 80, end: 90 },
            PortRange {
                start: 65530,
                end: 70000,
            },
            PortRange {
                start: 3000,
                end: 2999,
            },
            PortRange {
                start: 2000,
                end: 2002,
            },
            PortRange {
                start: 2001,
                end: 2003,
            },
        ]);
        assert_eq!(pool.into_iter().collect::<Vec<_>>(), vec![2000, 2001, 2002, 2003]);
    }

    #[test]
    fn available_excludes_live_records_only() {
        let ranges = [PortRange {
            start: 20000,
            end: 20009,
        }];
        let live = record("live", 20000, 20001);
        let mut no_v6 = record("nov6", 20002, 20003);
        no_v6.ipv6_enabled = false;
        let mut trashed = record("trashed", 20004, 20005);
        trashed.state = RecordState::Trashed;
        let mut draft = record("draft", 20006, 20007);
        draft.state = RecordState::Draft;

        let free = available_ports(&ranges, &[live, no_v6, trashed, draft]);
        assert!(!free.contains(&20000));
        assert!(!free.contains(&20001));
        assert!(!free.contains(&20002));
        // v6 port of an IPv6-disabled instance is not claimed.
        assert!(free.contains(&20003));
        for p in 20004..=20009 {
            assert!(free.contains(&p), "port {p} should be free");
        }
    }

    #[tokio::test]
    async fn sequential_session_never_repeats_then_exhausts() {
        let store = Arc::new(MemoryRecordStore::new());
        store.insert(record("a", 21001, 21003)).unwrap();
        let alloc = PortAllocator::new(
            vec![PortRange {
                start: 21000,
                end: 21004,
            }],
            PortAssignment::Sequential,
            store,
        );

        let mut s = alloc.session().await.unwrap();
        assert_eq!(s.remaining(), 3);
        assert_eq!(s.request_port().unwrap(), 21000);
        assert_eq!(s.request_port().unwrap(), 21002);
        assert_eq!(s.request_port().unwrap(), 21004);
        assert!(matches!(s.request_port(), Err(HiveError::ResourceExhausted)));
    }

    #[tokio::test]
    async fn random_session_stays_in_pool_without_repeats() {
        let store = Arc::new(MemoryRecordStore::new());
        let alloc = PortAllocator::new(
            vec![PortRange {
                start: 30000,
                end: 30019,
            }],
            PortAssignment::Random,
            store,
        );
        let mut s = alloc.session().await.unwrap();
        let mut seen = BTreeSet::new();
        for _ in 0..20 {
            let p = s.request_port().unwrap();
            assert!((30000..=30019).contains(&p));
            assert!(seen.insert(p), "port {p} handed out twice");
        }
        assert!(matches!(s.request_port(), Err(HiveError::ResourceExhausted)));
    }

    #[tokio::test]
    async fn new_session_sees_ports_persisted_by_previous_one() {
        let store = Arc::new(MemoryRecordStore::new());
        let id = InstanceId::parse("fresh").unwrap();
        store.insert(InstanceRecord::new(id.clone(), "fresh")).unwrap();
        let alloc = PortAllocator::new(
            vec![PortRange {
                start: 22000,
                end: 22003,
            }],
            PortAssignment::Sequential,
            store.clone(),
        );

        {
            let mut s = alloc.session().await.unwrap();
            let v4 = s.request_port().unwrap();
            let v6 = s.request_port().unwrap();
            store.set(&id, RecordField::PortV4(v4)).unwrap();
            store.set(&id, RecordField::PortV6(v6)).unwrap();
        }

        let free = alloc.available_ports().await.unwrap();
        assert_eq!(free.into_iter().collect::<Vec<_>>(), vec![22002, 22003]);
    }

    #[tokio::test]
    async fn concurrent_sessions_are_serialized() {
        let store = Arc::new(MemoryRecordStore::new());
        let alloc = Arc::new(PortAllocator::new(
            vec![PortRange {
                start: 23000,
                end: 23015,
            }],
            PortAssignment::Random,
            store.clone(),
        ));

        let mut set = tokio::task::JoinSet::new();
        for n in 0..8 {
            let id = InstanceId::parse(&format!("i{n}")).unwrap();
            store.insert(InstanceRecord::new(id.clone(), id.as_str())).unwrap();
            let (alloc, store) = (alloc.clone(), store.clone());
            set.spawn(async move {
                let mut s = alloc.session().await.unwrap();
                let v4 = s.request_port().unwrap();
                tokio::task::yield_now().await;
                let v6 = s.request_port().unwrap();
                store.set(&id, RecordField::PortV4(v4)).unwrap();
                store.set(&id, RecordField::PortV6(v6)).unwrap();
            });
        }
        while let Some(res) = set.join_next().await {
            res.unwrap();
        }

        let claimed: Vec<u16> = store
            .list()
            .unwrap()
            .iter()
            .flat_map(InstanceRecord::claimed_ports)
            .collect();
        let distinct: BTreeSet<u16> = claimed.iter().copied().collect();
        assert_eq!(claimed.len(), 16);
        assert_eq!(distinct.len(), 16);
        assert!(alloc.available_ports().await.unwrap().is_empty());
    }
}
