use std::time::Duration;

use crate::cluster::host::Host;

/// Schedules extra parallel executions of idempotent requests to cut tail
/// latency. One plan per request.
#[auto_impl::auto_impl(Arc)]
pub trait SpeculativeExecutionPolicy: Send + Sync {
    fn new_plan(&self) -> Box<dyn SpeculativePlan>;
}

/// Per-request schedule. `Some(ZERO)` launches immediately, `None` stops
/// speculating.
pub trait SpeculativePlan: Send {
    fn next_execution(&mut self, host: &Host) -> Option<Duration>;
}

/// Never speculates.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoSpeculativeExecutionPolicy;

impl SpeculativeExecutionPolicy for NoSpeculativeExecutionPolicy {
    fn new_plan(&self) -> Box<dyn SpeculativePlan> {
        struct Never;
        impl SpeculativePlan for Never {
            fn next_execution(&mut self, _host: &Host) -> Option<Duration> {
                None
            }
        }
        Box::new(Never)
    }
}

/// Up to `max_executions` extra executions, each `delay` after the previous
/// write.
#[derive(Debug, Clone, Copy)]
pub struct ConstantSpeculativeExecutionPolicy {
    pub delay: Duration,
    pub max_executions: usize,
}

impl SpeculativeExecutionPolicy for ConstantSpeculativeExecutionPolicy {
    fn new_plan(&self) -> Box<dyn SpeculativePlan> {
        struct Plan {
            delay: Duration,
            remaining: usize,
        }
        impl SpeculativePlan for Plan {
            fn next_execution(&mut self, _host: &Host) -> Option<Duration> {
                if self.remaining == 0 {
                    return None;
                }
                self.remaining -= 1;
                Some(self.delay)
            }
        }
        Box::new(Plan {
            delay: self.delay,
            remaining: self.max_executions,
        })
    }
}
