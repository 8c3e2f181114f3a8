//! Live flow storage keyed by normalized 5-tuple.

use std::collections::HashMap;

use chrono::{DateTime, TimeDelta, Utc};
use log::debug;

use super::accumulator::FlowAccumulator;
use super::key::{normalize, FlowKey};
use super::record::{CompletedFlow, EndReason};
use crate::packet::PacketRecord;

/// Outcome of folding one packet into the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ingested {
    pub key: FlowKey,
    pub created: bool,
    /// The flow has seen a FIN or RST and is ready to be taken out.
    pub terminated: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableStats {
    pub flows_created: u64,
    pub flows_drained: u64,
    pub clock_skew_anomalies: u64,
}

/// At most one accumulator per key. Owned by a single session.
#[derive(Debug, Default)]
pub struct FlowTable {
    flows: HashMap<FlowKey, FlowAccumulator>,
    next_id: u64,
    stats: TableStats,
}

impl FlowTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ingest(&mut self, packet: &PacketRecord) -> Ingested {
        let (key, _) = normalize(packet);

        if let Some(acc) = self.flows.get_mut(&key) {
            if acc.update(packet) {
                self.stats.clock_skew_anomalies += 1;
            }
            return Ingested {
                key,
                created: false,
                terminated: acc.terminated,
            };
        }

        let id = self.next_id;
        self.next_id += 1;
        let acc = FlowAccumulator::new(id, key, packet);
        let terminated = acc.terminated;
        debug!("New flow {}: {}", id, key);
        self.flows.insert(key, acc);
        self.stats.flows_created += 1;

        Ingested {
            key,
            created: true,
            terminated,
        }
    }

    /// Removes the flow under `key` if it has been closed by TCP.
    pub fn take_terminated(&mut self, key: &FlowKey) -> Option<CompletedFlow> {
        if !self.flows.get(key)?.terminated {
            return None;
        }
        let acc = self.flows.remove(key)?;
        self.stats.flows_drained += 1;
        Some(acc.complete(EndReason::TcpClose))
    }

    pub fn drain_terminated(&mut self) -> Vec<CompletedFlow> {
        self.drain_where(|acc| acc.terminated.then_some(EndReason::TcpClose))
    }

    /// Removes flows that are idle, too old, or closed as of `now`.
    pub fn drain_expired(
        &mut self,
        now: DateTime<Utc>,
        idle_timeout: TimeDelta,
        max_lifetime: TimeDelta,
    ) -> Vec<CompletedFlow> {
        self.drain_where(|acc| {
            if acc.terminated {
                Some(EndReason::TcpClose)
            } else if acc.exceeded_lifetime(now, max_lifetime) {
                Some(EndReason::LifetimeExceeded)
            } else if acc.is_idle(now, idle_timeout) {
                Some(EndReason::IdleTimeout)
            } else {
                None
            }
        })
    }

    pub fn drain_all(&mut self) -> Vec<CompletedFlow> {
        self.drain_where(|acc| {
            Some(if acc.terminated {
                EndReason::TcpClose
            } else {
                EndReason::EndOfCapture
            })
        })
    }

    fn drain_where<F>(&mut self, reason_for: F) -> Vec<CompletedFlow>
    where
        F: Fn(&FlowAccumulator) -> Option<EndReason>,
    {
        let expired: Vec<(FlowKey, EndReason)> = self
            .flows
            .iter()
            .filter_map(|(key, acc)| reason_for(acc).map(|reason| (*key, reason)))
            .collect();

        let mut drained: Vec<CompletedFlow> = expired
            .into_iter()
            .filter_map(|(key, reason)| self.flows.remove(&key).map(|acc| acc.complete(reason)))
            .collect();
        drained.sort_by_key(|flow| flow.id);

        self.stats.flows_drained += drained.len() as u64;
        for flow in &drained {
            debug!("Flow {} ended ({})", flow.id, flow.end_reason.as_str());
        }
        drained
    }

    pub fn get(&self, key: &FlowKey) -> Option<&FlowAccumulator> {
        self.flows.get(key)
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    pub fn stats(&self) -> &TableStats {
        &self.stats
    }
}
