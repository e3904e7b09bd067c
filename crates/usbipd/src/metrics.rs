use prometheus::{Encoder, IntCounter, IntGaugeVec, Opts, Registry, TextEncoder};

/// Prometheus metrics for the daemon, incremented from the session engine
/// and rendered on demand in the text exposition format.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,

    sessions_opened: IntCounter,
    sessions_closed: IntCounter,
    commands: IntCounter,
    submits_completed: IntCounter,
    urb_errors: IntCounter,
    replies_dropped: IntCounter,
    unlinks: IntCounter,
    protocol_errors: IntCounter,
}

fn counter(registry: &Registry, name: &str, help: &str) -> IntCounter {
    let counter = IntCounter::with_opts(Opts::new(name, help))
        .unwrap_or_else(|_| panic!("{name} metric must be valid"));
    registry
        .register(Box::new(counter.clone()))
        .unwrap_or_else(|_| panic!("{name} must register"));
    counter
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let build_info = IntGaugeVec::new(
            Opts::new("usbipd_build_info", "Build information for usbipd."),
            &["version"],
        )
        .expect("usbipd_build_info metric must be valid");
        registry
            .register(Box::new(build_info.clone()))
            .expect("usbipd_build_info must register");
        build_info
            .with_label_values(&[env!("CARGO_PKG_VERSION")])
            .set(1);

        Self {
            sessions_opened: counter(
                &registry,
                "usbipd_sessions_opened_total",
                "Total number of attached sessions opened.",
            ),
            sessions_closed: counter(
                &registry,
                "usbipd_sessions_closed_total",
                "Total number of attached sessions closed.",
            ),
            commands: counter(
                &registry,
                "usbipd_commands_total",
                "Total number of USB/IP commands received.",
            ),
            submits_completed: counter(
                &registry,
                "usbipd_submits_completed_total",
                "Total number of submits that produced a RET_SUBMIT.",
            ),
            urb_errors: counter(
                &registry,
                "usbipd_urb_errors_total",
                "Total number of URBs completed with an in-band error status.",
            ),
            replies_dropped: counter(
                &registry,
                "usbipd_replies_dropped_total",
                "Total number of completions suppressed by a client unlink.",
            ),
            unlinks: counter(
                &registry,
                "usbipd_unlinks_total",
                "Total number of CMD_UNLINK commands handled.",
            ),
            protocol_errors: counter(
                &registry,
                "usbipd_protocol_errors_total",
                "Total number of sessions ended by a protocol violation.",
            ),
            registry,
        }
    }

    pub(crate) fn session_opened(&self) {
        self.sessions_opened.inc();
    }

    pub(crate) fn session_closed(&self) {
        self.sessions_closed.inc();
    }

    pub(crate) fn command_received(&self) {
        self.commands.inc();
    }

    pub(crate) fn submit_completed(&self) {
        self.submits_completed.inc();
    }

    /// An URB (or at least one iso packet) completed with an in-band error
    /// status.
    pub(crate) fn urb_error(&self) {
        self.urb_errors.inc();
    }

    /// A completion found its pending entry gone: the client unlinked it.
    pub(crate) fn reply_dropped(&self) {
        self.replies_dropped.inc();
    }

    pub(crate) fn unlink_handled(&self) {
        self.unlinks.inc();
    }

    pub(crate) fn protocol_error(&self) {
        self.protocol_errors.inc();
    }

    pub fn replies_dropped_total(&self) -> u64 {
        self.replies_dropped.get()
    }

    /// Renders every registered metric in the Prometheus text exposition
    /// format.
    pub fn render_prometheus(&self) -> String {
        let metric_families = self.registry.gather();
        let encoder = TextEncoder::new();
        let mut buf = Vec::new();
        encoder
            .encode(&metric_families, &mut buf)
            .expect("prometheus encoding must succeed");
        String::from_utf8(buf).expect("prometheus text output is UTF-8")
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_reports_counter_values() {
        let metrics = Metrics::new();
        metrics.session_opened();
        metrics.command_received();
        metrics.command_received();

        let body = metrics.render_prometheus();
        assert!(body.contains("usbipd_sessions_opened_total 1"));
        assert!(body.contains("usbipd_commands_total 2"));
        assert!(body.contains("usbipd_replies_dropped_total 0"));
        assert!(body.contains("usbipd_build_info"));
    }

    #[test]
    fn clones_share_the_same_counters() {
        let metrics = Metrics::new();
        let clone = metrics.clone();
        clone.reply_dropped();
        assert_eq!(metrics.replies_dropped_total(), 1);
    }
}
