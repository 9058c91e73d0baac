//! Thermal throttling signal.
//!
//! A watch channel stands in for the platform thermal service: whoever owns
//! the [`ThermalMonitor`] publishes severity changes, the session holds a
//! receiver and annotates outgoing requests when throttling engages.

use tokio::sync::watch;
use tracing::info;

/// Reported thermal severity.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum ThrottleSeverity {
    /// Nominal operation.
    #[default]
    None,
    /// Elevated temperature, no action needed.
    Light,
    /// The pipeline should reduce load.
    Moderate,
    /// The pipeline must reduce load.
    Severe,
}

impl ThrottleSeverity {
    /// Whether this severity requires the session to throttle.
    pub fn throttles(self) -> bool {
        self >= ThrottleSeverity::Moderate
    }
}

/// Publisher side of the thermal signal.
#[derive(Debug)]
pub struct ThermalMonitor {
    tx: watch::Sender<ThrottleSeverity>,
}

impl Default for ThermalMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl ThermalMonitor {
    /// Creates a monitor reporting nominal conditions.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ThrottleSeverity::None);
        Self { tx }
    }

    /// Publishes a new severity. Receivers observe the latest value only.
    pub fn set_severity(&self, severity: ThrottleSeverity) {
        if *self.tx.borrow() != severity {
            info!(?severity, "thermal severity changed");
        }
        let _ = self.tx.send(severity);
    }

    /// Creates a receiver tracking the published severity.
    pub fn subscribe(&self) -> watch::Receiver<ThrottleSeverity> {
        self.tx.subscribe()
    }
}
