//! Per-agent vitals collection.
//!
//! Each agent owns a bounded ring of recent samples. When a store is
//! attached every record is written through, and windowed reads prefer the
//! store, falling back to the ring when it is unreachable. Historical
//! values are never mutated.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use cordon_core::prelude::*;
use cordon_store::Store;
use dashmap::DashMap;
use tracing::warn;

/// Default per-agent ring capacity.
pub const DEFAULT_RING_CAPACITY: usize = 2048;

/// Result of recording one sample.
#[derive(Debug, Clone, Copy)]
pub struct RecordOutcome {
    /// Per-agent sequence number assigned to the sample.
    pub seq: u64,
    /// False when the store write-through failed (sample kept locally).
    pub store_ok: bool,
}

#[derive(Debug)]
struct AgentRing {
    samples: VecDeque<(u64, AgentVitals)>,
    next_seq: u64,
    capacity: usize,
}

impl AgentRing {
    fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity.min(256)),
            next_seq: 0,
            capacity,
        }
    }

    fn push(&mut self, vitals: AgentVitals) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        if self.samples.len() == self.capacity {
            // Backpressure: drop the oldest sample.
            self.samples.pop_front();
        }
        self.samples.push_back((seq, vitals));
        seq
    }
}

/// Collects and serves agent vitals.
#[derive(Debug)]
pub struct TelemetryCollector {
    rings: DashMap<String, AgentRing>,
    store: Option<Arc<dyn Store>>,
    capacity: usize,
    total: AtomicU64,
}

impl TelemetryCollector {
    pub fn new(store: Option<Arc<dyn Store>>) -> Self {
        Self::with_capacity(DEFAULT_RING_CAPACITY, store)
    }

    pub fn with_capacity(capacity: usize, store: Option<Arc<dyn Store>>) -> Self {
        Self {
            rings: DashMap::new(),
            store,
            capacity,
            total: AtomicU64::new(0),
        }
    }

    /// Record one sample: ring append plus best-effort store write-through.
    pub async fn record(&self, vitals: AgentVitals) -> RecordOutcome {
        let agent_id = vitals.agent_id.clone();
        metrics::counter!("cordon_vitals_recorded_total", "agent" => agent_id.clone()).increment(1);
        metrics::histogram!("cordon_vitals_latency_ms", "agent" => agent_id.clone())
            .record(vitals.latency_ms);
        metrics::histogram!("cordon_vitals_tokens", "agent" => agent_id.clone())
            .record(vitals.token_count as f64);

        let mut store_ok = true;
        if let Some(store) = &self.store {
            if let Err(e) = store.write_agent_vitals(&vitals).await {
                // Best effort; a transient store failure never stops the pipeline.
                warn!(agent = %agent_id, error = %e, "vitals write-through failed");
                metrics::counter!("cordon_store_errors_total").increment(1);
                store_ok = false;
            }
        }

        self.total.fetch_add(1, Ordering::Relaxed);
        let mut ring = self
            .rings
            .entry(agent_id)
            .or_insert_with(|| AgentRing::new(self.capacity));
        let seq = ring.push(vitals);
        RecordOutcome { seq, store_ok }
    }

    /// Samples within `window`, oldest first. Prefers the store when
    /// attached, falls back to the local ring.
    pub async fn recent(&self, agent_id: &str, window: Duration) -> Vec<AgentVitals> {
        if let Some(store) = &self.store {
            match store.get_recent_agent_vitals(agent_id, window).await {
                Ok(samples) if !samples.is_empty() => return samples,
                Ok(_) => {}
                Err(e) => {
                    warn!(agent = agent_id, error = %e, "store window read failed, using ring");
                }
            }
        }
        self.recent_local(agent_id, window)
    }

    /// Ring-only windowed read.
    pub fn recent_local(&self, agent_id: &str, window: Duration) -> Vec<AgentVitals> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::seconds(10));
        self.rings
            .get(agent_id)
            .map(|ring| {
                ring.samples
                    .iter()
                    .filter(|(_, v)| v.timestamp >= cutoff)
                    .map(|(_, v)| v.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Samples recorded after `since_seq`, with the next cursor value.
    /// Used by the sentinel loop to fold screened samples into the baseline
    /// exactly once.
    pub fn samples_since(&self, agent_id: &str, since_seq: u64) -> (Vec<AgentVitals>, u64) {
        match self.rings.get(agent_id) {
            Some(ring) => {
                let out: Vec<AgentVitals> = ring
                    .samples
                    .iter()
                    .filter(|(seq, _)| *seq >= since_seq)
                    .map(|(_, v)| v.clone())
                    .collect();
                (out, ring.next_seq)
            }
            None => (Vec::new(), since_seq),
        }
    }

    /// Most recent sample for an agent.
    pub async fn latest(&self, agent_id: &str) -> Option<AgentVitals> {
        if let Some(store) = &self.store {
            match store.get_latest_agent_vitals(agent_id).await {
                Ok(Some(v)) => return Some(v),
                Ok(None) => {}
                Err(e) => {
                    warn!(agent = agent_id, error = %e, "store latest read failed, using ring")
                }
            }
        }
        self.rings
            .get(agent_id)
            .and_then(|ring| ring.samples.back().map(|(_, v)| v.clone()))
    }

    /// Locally observed sample count for one agent.
    pub fn count(&self, agent_id: &str) -> usize {
        self.rings
            .get(agent_id)
            .map(|ring| ring.samples.len())
            .unwrap_or(0)
    }

    /// Total samples recorded by this collector.
    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    /// Agent ids with at least one recorded sample.
    pub fn agent_ids(&self) -> Vec<String> {
        self.rings.iter().map(|e| e.key().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cordon_store::memory::MemoryStore;

    fn vitals(agent: &str, latency: f64) -> AgentVitals {
        AgentVitals {
            agent_id: agent.to_string(),
            timestamp: Utc::now(),
            latency_ms: latency,
            input_tokens: 500,
            output_tokens: 500,
            token_count: 1000,
            tool_calls: 2,
            retries: 0,
            success: true,
            cost: 0.01,
            model: "gpt-4o".to_string(),
            error_type: VitalError::None,
            prompt_hash: "ab12cd34".to_string(),
            agent_type: None,
            mcp_servers: Vec::new(),
        }
    }

    #[tokio::test]
    async fn record_and_read_back() {
        let collector = TelemetryCollector::new(None);
        for i in 0..5 {
            collector.record(vitals("a1", 100.0 + i as f64)).await;
        }
        let recent = collector.recent("a1", Duration::from_secs(60)).await;
        assert_eq!(recent.len(), 5);
        assert_eq!(recent[0].latency_ms, 100.0);
        assert_eq!(collector.count("a1"), 5);
        assert_eq!(collector.total(), 5);
        assert_eq!(
            collector.latest("a1").await.unwrap().latency_ms,
            104.0
        );
    }

    #[tokio::test]
    async fn ring_drops_oldest_when_full() {
        let collector = TelemetryCollector::with_capacity(3, None);
        for i in 0..5 {
            collector.record(vitals("a1", i as f64)).await;
        }
        let recent = collector.recent_local("a1", Duration::from_secs(60));
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].latency_ms, 2.0);
    }

    #[tokio::test]
    async fn cursor_reads_each_sample_once() {
        let collector = TelemetryCollector::new(None);
        collector.record(vitals("a1", 1.0)).await;
        collector.record(vitals("a1", 2.0)).await;

        let (batch, cursor) = collector.samples_since("a1", 0);
        assert_eq!(batch.len(), 2);

        collector.record(vitals("a1", 3.0)).await;
        let (batch, cursor) = collector.samples_since("a1", cursor);
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].latency_ms, 3.0);

        let (batch, _) = collector.samples_since("a1", cursor);
        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn store_write_through() {
        let store = Arc::new(MemoryStore::new("run-t"));
        let collector = TelemetryCollector::new(Some(store.clone() as Arc<dyn Store>));
        collector.record(vitals("a1", 100.0)).await;
        assert_eq!(store.get_total_executions().await.unwrap(), 1);
    }
}
