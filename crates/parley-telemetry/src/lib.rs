use once_cell::sync::Lazy;
use prometheus::{CounterVec, Encoder, Opts, Registry, TextEncoder};
use tracing_subscriber::{fmt, EnvFilter};

static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

fn counter(name: &str, help: &str, labels: &[&str]) -> CounterVec {
    let cv = match CounterVec::new(Opts::new(name, help), labels) {
        Ok(cv) => cv,
        // Names and labels are compile-time constants; a failure here is a typo.
        Err(e) => panic!("invalid metric {name}: {e}"),
    };
    REGISTRY.register(Box::new(cv.clone())).ok();
    cv
}

static API_REQUESTS: Lazy<CounterVec> = Lazy::new(|| counter("parley_api_requests_total", "API requests total", &["path"]));
static SESSIONS: Lazy<CounterVec> = Lazy::new(|| counter("parley_sessions_total", "Voice session lifecycle events", &["event"]));
static DROPPED_FRAMES: Lazy<CounterVec> = Lazy::new(|| counter("parley_dropped_frames_total", "Audio frames evicted by drop-oldest buffers", &["direction"]));
static CONSOLIDATIONS: Lazy<CounterVec> = Lazy::new(|| counter("parley_consolidations_total", "Memory consolidations by status", &["status"]));
static TOOL_CALLS: Lazy<CounterVec> = Lazy::new(|| counter("parley_tool_calls_total", "Live tool calls by name and status", &["tool", "status"]));

pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt = fmt().with_env_filter(filter).with_target(false);
    // Enable JSON logs if PARLEY_LOG_JSON=1
    if std::env::var("PARLEY_LOG_JSON").ok().as_deref() == Some("1") {
        fmt.json().init();
    } else {
        fmt.init();
    }
}

pub fn inc_api_request(path: &str) { API_REQUESTS.with_label_values(&[path]).inc(); }
pub fn inc_session(event: &str) { SESSIONS.with_label_values(&[event]).inc(); }
pub fn add_dropped_frames(direction: &str, n: u64) { if n > 0 { DROPPED_FRAMES.with_label_values(&[direction]).inc_by(n as f64); } }
pub fn inc_consolidation(status: &str) { CONSOLIDATIONS.with_label_values(&[status]).inc(); }
pub fn inc_tool_call(tool: &str, status: &str) { TOOL_CALLS.with_label_values(&[tool, status]).inc(); }

pub fn gather_prometheus() -> String {
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    encoder.encode(&metric_families, &mut buffer).ok();
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_show_up_in_exposition() {
        inc_session("opened");
        inc_tool_call("emotion", "ok");
        let text = gather_prometheus();
        assert!(text.contains("parley_sessions_total"));
        assert!(text.contains("tool=\"emotion\""));
    }
}
