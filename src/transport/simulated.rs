//! Synthetic transport.
//!
//! In random mode establishment fails with `failure_rate`, each probe reports
//! up to `max_bytes_per_probe` bytes per direction and the link drops with
//! `link_loss_probability`. Scripted mode replaces the dice with queues of
//! forced outcomes so lifecycle tests are deterministic.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tracing::debug;

use super::{ProbeSample, SessionHandle, Transport, TransportError};
use crate::config::model::{SimulatedSettings, TunnelConfig};

pub struct SimulatedTransport {
    settings: SimulatedSettings,
    next_handle: AtomicU64,
    establish_calls: AtomicUsize,
    /// Open sessions and the local port each one has bound, if any.
    sessions: Mutex<HashMap<SessionHandle, Option<u16>>>,
    script: Mutex<Script>,
}

#[derive(Default)]
struct Script {
    establish: VecDeque<Result<(), TransportError>>,
    bind: VecDeque<Result<(), TransportError>>,
    probes: VecDeque<Result<ProbeSample, TransportError>>,
    establish_delay: Duration,
    /// Returned when `probes` is empty. `None` rolls random samples.
    steady_probe: Option<ProbeSample>,
}

impl SimulatedTransport {
    pub fn new(settings: SimulatedSettings) -> Self {
        Self {
            settings,
            next_handle: AtomicU64::new(1),
            establish_calls: AtomicUsize::new(0),
            sessions: Mutex::new(HashMap::new()),
            script: Mutex::new(Script::default()),
        }
    }

    /// Never fails on its own, reports a fixed sample on every probe.
    pub fn scripted() -> Self {
        let transport = Self::new(SimulatedSettings {
            failure_rate: 0.0,
            link_loss_probability: 0.0,
            min_latency_ms: 0,
            max_latency_ms: 0,
            max_bytes_per_probe: 0,
        });
        transport.script().steady_probe = Some(ProbeSample {
            bytes_sent: 100,
            bytes_received: 200,
            latency: Some(Duration::from_millis(1)),
        });
        transport
    }

    /// Queue an outcome for the next `establish` call.
    pub fn push_establish(&self, outcome: Result<(), TransportError>) {
        self.script().establish.push_back(outcome);
    }

    /// Queue an outcome for the next `bind_forward` call.
    pub fn push_bind(&self, outcome: Result<(), TransportError>) {
        self.script().bind.push_back(outcome);
    }

    /// Queue an outcome for the next `probe` call.
    pub fn push_probe(&self, outcome: Result<ProbeSample, TransportError>) {
        self.script().probes.push_back(outcome);
    }

    /// Hold every `establish` call for `delay` before resolving it.
    pub fn set_establish_delay(&self, delay: Duration) {
        self.script().establish_delay = delay;
    }

    pub fn set_steady_probe(&self, sample: Option<ProbeSample>) {
        self.script().steady_probe = sample;
    }

    pub fn establish_calls(&self) -> usize {
        self.establish_calls.load(Ordering::SeqCst)
    }

    pub fn open_sessions(&self) -> usize {
        self.sessions().len()
    }

    pub fn is_open(&self, handle: SessionHandle) -> bool {
        self.sessions().contains_key(&handle)
    }

    fn script(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<SessionHandle, Option<u16>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn random_latency(&self) -> Duration {
        let low = self.settings.min_latency_ms.min(self.settings.max_latency_ms);
        let high = self.settings.min_latency_ms.max(self.settings.max_latency_ms);
        Duration::from_millis(rand::thread_rng().gen_range(low..=high))
    }

    fn roll_establish(&self, config: &TunnelConfig) -> Result<(), TransportError> {
        if rand::thread_rng().gen_bool(probability(self.settings.failure_rate)) {
            return Err(TransportError::Unreachable(format!(
                "{}:{} did not answer",
                config.host, config.port
            )));
        }
        Ok(())
    }

    fn roll_probe(&self) -> Result<ProbeSample, TransportError> {
        let mut rng = rand::thread_rng();
        if rng.gen_bool(probability(self.settings.link_loss_probability)) {
            return Err(TransportError::LinkLost("connection reset by peer".into()));
        }
        let max = self.settings.max_bytes_per_probe;
        Ok(ProbeSample {
            bytes_sent: rng.gen_range(0..=max),
            bytes_received: rng.gen_range(0..=max),
            latency: Some(self.random_latency()),
        })
    }
}

/// Clamp into `[0, 1]`; non-finite values never fire.
fn probability(p: f64) -> f64 {
    if p.is_finite() {
        p.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

impl Default for SimulatedTransport {
    fn default() -> Self {
        Self::new(SimulatedSettings::default())
    }
}

#[async_trait]
impl Transport for SimulatedTransport {
    async fn establish(&self, config: &TunnelConfig) -> Result<SessionHandle, TransportError> {
        self.establish_calls.fetch_add(1, Ordering::SeqCst);

        let (scripted, delay) = {
            let mut script = self.script();
            (script.establish.pop_front(), script.establish_delay)
        };
        let delay = if delay.is_zero() {
            self.random_latency()
        } else {
            delay
        };
        tokio::time::sleep(delay).await;

        scripted.unwrap_or_else(|| self.roll_establish(config))?;

        let handle = SessionHandle(self.next_handle.fetch_add(1, Ordering::SeqCst));
        self.sessions().insert(handle, None);
        debug!(%handle, host = %config.host, "Simulated session established");
        Ok(handle)
    }

    async fn bind_forward(
        &self,
        handle: SessionHandle,
        local_port: u16,
        _remote_host: &str,
        _remote_port: u16,
    ) -> Result<(), TransportError> {
        if let Some(outcome) = self.script().bind.pop_front() {
            outcome?;
        }

        let mut sessions = self.sessions();
        if sessions
            .iter()
            .any(|(h, port)| *h != handle && *port == Some(local_port))
        {
            return Err(TransportError::PortInUse(local_port));
        }
        match sessions.get_mut(&handle) {
            Some(bound) => {
                *bound = Some(local_port);
                Ok(())
            }
            None => Err(TransportError::Session(format!("{handle} is not open"))),
        }
    }

    async fn close(&self, handle: SessionHandle) {
        if self.sessions().remove(&handle).is_some() {
            debug!(%handle, "Simulated session closed");
        }
    }

    async fn probe(&self, handle: SessionHandle) -> Result<ProbeSample, TransportError> {
        if !self.is_open(handle) {
            return Err(TransportError::LinkLost(format!("{handle} is closed")));
        }
        let (scripted, steady) = {
            let mut script = self.script();
            (script.probes.pop_front(), script.steady_probe)
        };
        match (scripted, steady) {
            (Some(outcome), _) => outcome,
            (None, Some(sample)) => Ok(sample),
            (None, None) => self.roll_probe(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::model::Credentials;

    fn config() -> TunnelConfig {
        TunnelConfig {
            host: "bastion".into(),
            port: 22,
            username: Some("deploy".into()),
            credentials: Credentials {
                password: Some("pw".into()),
                ..Credentials::default()
            },
            local_port: Some(5433),
            remote_host: "db".into(),
            remote_port: 5432,
            keep_alive: true,
            connect_timeout_secs: 15,
        }
    }

    #[tokio::test]
    async fn test_scripted_establish_failure() {
        let transport = SimulatedTransport::scripted();
        transport.push_establish(Err(TransportError::Unreachable("nope".into())));

        let err = transport.establish(&config()).await.unwrap_err();
        assert_eq!(err, TransportError::Unreachable("nope".into()));
        assert_eq!(transport.open_sessions(), 0);

        assert!(transport.establish(&config()).await.is_ok());
        assert_eq!(transport.establish_calls(), 2);
    }

    #[tokio::test]
    async fn test_bind_collision_between_sessions() {
        let transport = SimulatedTransport::scripted();
        let a = transport.establish(&config()).await.unwrap();
        let b = transport.establish(&config()).await.unwrap();

        transport.bind_forward(a, 5433, "db", 5432).await.unwrap();
        let err = transport.bind_forward(b, 5433, "db", 5432).await.unwrap_err();
        assert_eq!(err, TransportError::PortInUse(5433));

        transport.close(a).await;
        transport.bind_forward(b, 5433, "db", 5432).await.unwrap();
    }

    #[tokio::test]
    async fn test_probe_after_close_is_link_lost() {
        let transport = SimulatedTransport::scripted();
        let handle = transport.establish(&config()).await.unwrap();
        assert!(transport.probe(handle).await.is_ok());

        transport.close(handle).await;
        assert!(matches!(
            transport.probe(handle).await,
            Err(TransportError::LinkLost(_))
        ));
    }

    #[tokio::test]
    async fn test_scripted_probe_queue_before_steady() {
        let transport = SimulatedTransport::scripted();
        let handle = transport.establish(&config()).await.unwrap();
        transport.push_probe(Err(TransportError::LinkLost("cable".into())));

        assert!(transport.probe(handle).await.is_err());
        let sample = transport.probe(handle).await.unwrap();
        assert_eq!(sample.bytes_sent, 100);
        assert_eq!(sample.bytes_received, 200);
    }

    #[tokio::test]
    async fn test_clearing_steady_probe_rolls_samples() {
        let transport = SimulatedTransport::scripted();
        let handle = transport.establish(&config()).await.unwrap();
        transport.set_steady_probe(None);

        // Scripted settings allow zero bytes and zero latency only.
        let sample = transport.probe(handle).await.unwrap();
        assert_eq!(sample, ProbeSample {
            bytes_sent: 0,
            bytes_received: 0,
            latency: Some(Duration::ZERO),
        });
    }

    #[tokio::test]
    async fn test_random_mode_bounds() {
        let transport = SimulatedTransport::new(SimulatedSettings {
            failure_rate: 0.0,
            link_loss_probability: 0.0,
            min_latency_ms: 0,
            max_latency_ms: 1,
            max_bytes_per_probe: 10,
        });
        let handle = transport.establish(&config()).await.unwrap();
        for _ in 0..20 {
            let sample = transport.probe(handle).await.unwrap();
            assert!(sample.bytes_sent <= 10);
            assert!(sample.bytes_received <= 10);
            assert!(sample.latency.unwrap() <= Duration::from_millis(1));
        }
    }

    #[tokio::test]
    async fn test_certain_failure_rate_always_fails() {
        let transport = SimulatedTransport::new(SimulatedSettings {
            failure_rate: 1.0,
            min_latency_ms: 0,
            max_latency_ms: 0,
            ..SimulatedSettings::default()
        });
        assert!(matches!(
            transport.establish(&config()).await,
            Err(TransportError::Unreachable(_))
        ));
    }

    #[test]
    fn test_probability_sanitizes_settings() {
        assert_eq!(probability(f64::NAN), 0.0);
        assert_eq!(probability(f64::INFINITY), 0.0);
        assert_eq!(probability(-0.5), 0.0);
        assert_eq!(probability(2.0), 1.0);
        assert_eq!(probability(0.25), 0.25);
    }

    #[tokio::test]
    async fn test_nan_probabilities_never_fail() {
        let transport = SimulatedTransport::new(SimulatedSettings {
            failure_rate: f64::NAN,
            link_loss_probability: f64::NAN,
            min_latency_ms: 0,
            max_latency_ms: 0,
            max_bytes_per_probe: 5,
        });
        let handle = transport.establish(&config()).await.unwrap();
        for _ in 0..10 {
            assert!(transport.probe(handle).await.is_ok());
        }
    }
}
