//! Prometheus text exposition for the admin `/metrics` route

use std::fmt::Write;

use crate::{Counter, Gauge, HistogramSnapshot};

/// Accumulates metric families in text exposition format
#[derive(Debug, Default)]
pub struct Exposition {
    output: String,
}

impl Exposition {
    pub fn new() -> Self {
        Self::default()
    }

    fn family(&mut self, name: &str, kind: &str, help: &str) {
        let _ = writeln!(self.output, "# HELP {} {}", name, help);
        let _ = writeln!(self.output, "# TYPE {} {}", name, kind);
    }

    pub fn counter(&mut self, name: &str, help: &str, value: u64) -> &mut Self {
        self.family(name, "counter", help);
        let _ = writeln!(self.output, "{} {}", name, value);
        self
    }

    pub fn gauge(&mut self, name: &str, help: &str, value: u64) -> &mut Self {
        self.family(name, "gauge", help);
        let _ = writeln!(self.output, "{} {}", name, value);
        self
    }

    pub fn counter_of(&mut self, counter: &Counter, help: &str) -> &mut Self {
        self.counter(counter.name(), help, counter.get())
    }

    pub fn gauge_of(&mut self, gauge: &Gauge, help: &str) -> &mut Self {
        self.gauge(gauge.name(), help, gauge.get())
    }

    /// One gauge family with a sample per label value
    pub fn labeled_gauge<'a>(
        &mut self,
        name: &str,
        help: &str,
        label: &str,
        samples: impl IntoIterator<Item = (&'a str, u64)>,
    ) -> &mut Self {
        self.family(name, "gauge", help);
        for (value_of_label, value) in samples {
            let _ = writeln!(
                self.output,
                "{}{{{}=\"{}\"}} {}",
                name,
                label,
                escape(value_of_label),
                value
            );
        }
        self
    }

    /// Latency window as a summary: quantiles plus count
    pub fn summary(&mut self, name: &str, help: &str, snapshot: &HistogramSnapshot) -> &mut Self {
        self.family(name, "summary", help);
        let _ = writeln!(self.output, "{}{{quantile=\"0.5\"}} {}", name, snapshot.p50);
        let _ = writeln!(self.output, "{}{{quantile=\"0.99\"}} {}", name, snapshot.p99);
        let _ = writeln!(
            self.output,
            "{}_sum {}",
            name,
            snapshot.mean * snapshot.count as f64
        );
        let _ = writeln!(self.output, "{}_count {}", name, snapshot.count);
        self
    }

    pub fn finish(self) -> String {
        self.output
    }
}

fn escape(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_families_carry_help_and_type() {
        let sent = Counter::new("smsc_messages_sent_total");
        sent.add(3);
        let mut exposition = Exposition::new();
        exposition
            .counter_of(&sent, "Messages handed to an operator")
            .gauge("smsc_queue_depth", "Messages waiting", 7);
        let text = exposition.finish();

        assert!(text.contains("# TYPE smsc_messages_sent_total counter\nsmsc_messages_sent_total 3\n"));
        assert!(text.contains("# HELP smsc_queue_depth Messages waiting\n"));
        assert!(text.contains("smsc_queue_depth 7\n"));
    }

    #[test]
    fn test_label_values_are_escaped() {
        let mut exposition = Exposition::new();
        exposition.labeled_gauge(
            "smsc_operator_queued",
            "Queued per operator",
            "operator",
            [("a\"b", 2)],
        );
        assert!(exposition
            .finish()
            .contains("smsc_operator_queued{operator=\"a\\\"b\"} 2\n"));
    }

    #[test]
    fn test_summary_reports_quantiles() {
        let snapshot = HistogramSnapshot {
            count: 4,
            mean: 2.5,
            p50: 2.0,
            p99: 4.0,
        };
        let mut exposition = Exposition::new();
        exposition.summary("smsc_dispatch_latency_ms", "Send latency", &snapshot);
        let text = exposition.finish();
        assert!(text.contains("smsc_dispatch_latency_ms{quantile=\"0.99\"} 4\n"));
        assert!(text.contains("smsc_dispatch_latency_ms_sum 10\n"));
        assert!(text.contains("smsc_dispatch_latency_ms_count 4\n"));
    }
}
