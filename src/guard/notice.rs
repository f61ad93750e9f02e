//! Log events emitted by the orchestrator.

use tracing::{error, warn};

use crate::ratelimit::{RateSpec, Rejection};
use crate::store::StoreError;

/// Context attached to every guard log line.
#[derive(Debug, Clone, Copy)]
pub struct LimitNotice<'a> {
    pub resource: &'a str,
    pub method: &'a str,
    pub spec: &'a RateSpec,
    /// Resolved fallback signature, empty when none resolves
    pub fallback: &'a str,
}

impl<'a> LimitNotice<'a> {
    pub fn new(resource: &'a str, method: &'a str, spec: &'a RateSpec, fallback: &'a str) -> Self {
        Self {
            resource,
            method,
            spec,
            fallback,
        }
    }

    /// A granted call failed.
    pub fn log_guarded_failure(&self, err: &anyhow::Error, retrying: bool) {
        error!(
            resource = %self.resource,
            method = %self.method,
            rate = self.spec.rate,
            interval = self.spec.interval,
            interval_unit = %self.spec.interval_unit,
            permits = self.spec.permits,
            fallback = %self.fallback,
            retrying = retrying,
            error = %err,
            "Guarded call failed"
        );
    }

    /// The store could not be consulted; the call goes through unchecked.
    pub fn log_store_failure(&self, err: &StoreError) {
        error!(
            resource = %self.resource,
            method = %self.method,
            rate = self.spec.rate,
            interval = self.spec.interval,
            interval_unit = %self.spec.interval_unit,
            permits = self.spec.permits,
            fallback = %self.fallback,
            error = %err,
            "Limiter store failed, admitting call"
        );
    }

    pub fn log_rejected(&self, rejection: &Rejection) {
        warn!(
            resource = %self.resource,
            method = %self.method,
            rate = self.spec.rate,
            interval = self.spec.interval,
            interval_unit = %self.spec.interval_unit,
            permits = self.spec.permits,
            fallback = %self.fallback,
            reason = %rejection.reason,
            "Call rate limited"
        );
    }
}

/// Collects formatted log output for the current thread.
#[cfg(test)]
pub(crate) mod capture {
    use std::io;
    use std::sync::Arc;

    use parking_lot::Mutex;
    use tracing::subscriber::DefaultGuard;
    use tracing::Level;

    #[derive(Clone, Default)]
    struct Buffer(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Buffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    pub(crate) struct CapturedLogs {
        buffer: Buffer,
        _guard: DefaultGuard,
    }

    impl CapturedLogs {
        /// Route warn and error events on this thread into a buffer.
        pub(crate) fn start() -> Self {
            let buffer = Buffer::default();
            let writer = buffer.clone();
            let subscriber = tracing_subscriber::fmt()
                .with_writer(move || writer.clone())
                .with_ansi(false)
                .with_max_level(Level::WARN)
                .finish();
            Self {
                buffer,
                _guard: tracing::subscriber::set_default(subscriber),
            }
        }

        /// Lines containing `needle`.
        pub(crate) fn lines_with(&self, needle: &str) -> Vec<String> {
            let bytes = self.buffer.0.lock().clone();
            String::from_utf8_lossy(&bytes)
                .lines()
                .filter(|line| line.contains(needle))
                .map(str::to_string)
                .collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::capture::CapturedLogs;
    use super::*;
    use crate::ratelimit::{RejectReason, TimeUnit};

    fn spec() -> RateSpec {
        RateSpec::new(5).per(2, TimeUnit::Minutes).permits(2).fallback("on_limited")
    }

    #[test]
    fn test_rejected_event_fields() {
        let logs = CapturedLogs::start();
        let spec = spec();
        let notice = LimitNotice::new(
            "orders:42",
            "shop::OrderService:place(Order)",
            &spec,
            "shop::OrderService:on_limited(Order)",
        );

        notice.log_rejected(&Rejection::new(RejectReason::NonBlockingTimeout));

        let lines = logs.lines_with("Call rate limited");
        assert_eq!(lines.len(), 1);
        let line = &lines[0];
        assert!(line.contains("WARN"));
        for field in [
            "resource=orders:42",
            "method=shop::OrderService:place(Order)",
            "rate=5",
            "interval=2",
            "interval_unit=minutes",
            "permits=2",
            "fallback=shop::OrderService:on_limited(Order)",
            "reason=non-blocking timeout",
        ] {
            assert!(line.contains(field), "missing {field} in {line}");
        }
    }

    #[test]
    fn test_guarded_failure_event_fields() {
        let logs = CapturedLogs::start();
        let spec = RateSpec::new(3);
        let notice = LimitNotice::new("orders", "shop::OrderService:place(Order)", &spec, "");

        notice.log_guarded_failure(&anyhow::anyhow!("downstream timeout"), true);

        let lines = logs.lines_with("Guarded call failed");
        assert_eq!(lines.len(), 1);
        let line = &lines[0];
        assert!(line.contains("ERROR"));
        for field in [
            "resource=orders",
            "rate=3",
            "interval=1",
            "interval_unit=seconds",
            "permits=1",
            "fallback= retrying=true",
            "error=downstream timeout",
        ] {
            assert!(line.contains(field), "missing {field} in {line}");
        }
    }
}
