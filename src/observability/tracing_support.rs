//! Tracing integration for structured logging and spans.

use tracing::{Level, Span, span};

/// Configuration for tracing behavior.
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Whether to create spans around instance pool operations.
    pub pool_spans: bool,
    /// Whether to create spans around individual inferences.
    pub instance_spans: bool,
    /// Level of pool spans. Instance spans sit one level below.
    pub level: Level,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            pool_spans: true,
            instance_spans: true,
            level: Level::INFO,
        }
    }
}

impl TracingConfig {
    /// Everything enabled.
    pub fn all() -> Self {
        Self {
            pool_spans: true,
            instance_spans: true,
            level: Level::DEBUG,
        }
    }

    /// Pool spans only.
    pub fn minimal() -> Self {
        Self {
            pool_spans: true,
            instance_spans: false,
            level: Level::INFO,
        }
    }

    /// Disable all spans.
    pub fn none() -> Self {
        Self {
            pool_spans: false,
            instance_spans: false,
            level: Level::INFO,
        }
    }

    /// Span for a pool operation, or a disabled span.
    pub fn pool_span(&self, model_id: &str) -> Span {
        if self.pool_spans {
            span_pool(self.level, model_id)
        } else {
            Span::none()
        }
    }

    /// Span for an inference, or a disabled span.
    pub fn instance_span(&self, model_id: &str, instance_id: u64) -> Span {
        if self.instance_spans {
            span_instance(below(self.level), model_id, instance_id)
        } else {
            Span::none()
        }
    }
}

/// `span!` needs a constant level.
macro_rules! span_at {
    ($level:expr, $($rest:tt)+) => {{
        let level = $level;
        if level == Level::ERROR {
            span!(Level::ERROR, $($rest)+)
        } else if level == Level::WARN {
            span!(Level::WARN, $($rest)+)
        } else if level == Level::INFO {
            span!(Level::INFO, $($rest)+)
        } else if level == Level::DEBUG {
            span!(Level::DEBUG, $($rest)+)
        } else {
            span!(Level::TRACE, $($rest)+)
        }
    }};
}

/// The next more verbose level.
fn below(level: Level) -> Level {
    if level == Level::ERROR {
        Level::WARN
    } else if level == Level::WARN {
        Level::INFO
    } else if level == Level::INFO {
        Level::DEBUG
    } else {
        Level::TRACE
    }
}

/// Create a span for an instance pool.
///
/// # Example
///
/// ```rust,ignore
/// use cistern::observability::span_pool;
/// use tracing::Level;
///
/// let span = span_pool(Level::INFO, "resnet50");
/// let _guard = span.enter();
/// ```
#[inline]
pub fn span_pool(level: Level, model_id: &str) -> Span {
    span_at!(level, "instance_pool", model = %model_id)
}

/// Create a span for work on one instance.
#[inline]
pub fn span_instance(level: Level, model_id: &str, instance_id: u64) -> Span {
    span_at!(
        level,
        "instance",
        model = %model_id,
        instance = instance_id
    )
}

/// Log a block allocation.
#[inline]
pub fn trace_allocation(pool: &str, address: usize, size: usize, alignment: usize) {
    tracing::debug!(
        pool = %pool,
        address,
        size,
        alignment,
        "block allocated"
    );
}

/// Log a block returning to the free list.
#[inline]
pub fn trace_free(pool: &str, address: usize, size: usize, merged: usize) {
    tracing::debug!(
        pool = %pool,
        address,
        size,
        merged,
        "block freed"
    );
}

/// Log an instance status change.
#[inline]
pub fn trace_status_change(model_id: &str, instance_id: u64, from: &str, to: &str) {
    tracing::debug!(
        model = %model_id,
        instance = instance_id,
        from = %from,
        to = %to,
        "instance status changed"
    );
}

/// Log an instance eviction.
#[inline]
pub fn trace_eviction(model_id: &str, instance_id: u64, reason: &str) {
    tracing::info!(
        model = %model_id,
        instance = instance_id,
        reason = %reason,
        "instance evicted"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracing_config_default() {
        let config = TracingConfig::default();
        assert!(config.pool_spans);
        assert!(config.instance_spans);
        assert_eq!(config.level, Level::INFO);
    }

    #[test]
    fn test_tracing_config_presets() {
        assert_eq!(TracingConfig::all().level, Level::DEBUG);
        assert!(!TracingConfig::minimal().instance_spans);
        let none = TracingConfig::none();
        assert!(!none.pool_spans && !none.instance_spans);
    }

    #[test]
    fn test_disabled_spans() {
        let config = TracingConfig::none();
        assert!(config.pool_span("m").is_disabled());
        assert!(config.instance_span("m", 0).is_disabled());
    }

    #[test]
    fn test_instance_level_below_pool_level() {
        assert_eq!(below(Level::ERROR), Level::WARN);
        assert_eq!(below(Level::INFO), Level::DEBUG);
        assert_eq!(below(Level::DEBUG), Level::TRACE);
        assert_eq!(below(Level::TRACE), Level::TRACE);
    }

    #[test]
    fn test_spans_follow_configured_level() {
        use std::sync::{Arc, Mutex};
        use tracing::subscriber::with_default;
        use tracing::{Metadata, Subscriber, span};

        struct Levels(Arc<Mutex<Vec<(String, Level)>>>);

        impl Subscriber for Levels {
            fn enabled(&self, _: &Metadata<'_>) -> bool {
                true
            }
            fn new_span(&self, attrs: &span::Attributes<'_>) -> span::Id {
                let meta = attrs.metadata();
                self.0.lock().unwrap().push((meta.name().to_string(), *meta.level()));
                span::Id::from_u64(1)
            }
            fn record(&self, _: &span::Id, _: &span::Record<'_>) {}
            fn record_follows_from(&self, _: &span::Id, _: &span::Id) {}
            fn event(&self, _: &tracing::Event<'_>) {}
            fn enter(&self, _: &span::Id) {}
            fn exit(&self, _: &span::Id) {}
        }

        let seen = Arc::new(Mutex::new(Vec::new()));
        let config = TracingConfig {
            level: Level::WARN,
            ..TracingConfig::default()
        };
        with_default(Levels(Arc::clone(&seen)), || {
            let _pool = config.pool_span("m");
            let _instance = config.instance_span("m", 1);
        });
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                ("instance_pool".to_string(), Level::WARN),
                ("instance".to_string(), Level::INFO),
            ]
        );
    }

    #[test]
    fn test_trace_functions() {
        // No subscriber installed: these must not panic.
        let _span = span_pool(Level::INFO, "m");
        let _span = span_instance(Level::TRACE, "m", 3);
        trace_allocation("cpu", 0x1000, 64, 16);
        trace_free("cpu", 0x1000, 64, 1);
        trace_status_change("m", 1, "idle", "busy");
        trace_eviction("m", 1, "idle timeout");
    }
}
