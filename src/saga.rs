//! Ordered steps with compensations, unwound on failure.

use async_trait::async_trait;

use crate::error::Result;

/// One forward action of a [`Saga`] and how to undo it.
#[async_trait]
pub trait Step<C: Send + Sync>: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &'static str;

    async fn execute(&self, ctx: &mut C) -> Result<()>;

    /// Undo a successful [`Step::execute`]. Nothing by default.
    async fn compensate(&self, _ctx: &C) -> Result<()> {
        Ok(())
    }
}

/// Sequence of [`Step`] sharing a context.
///
/// When a step fails, every step completed before it is compensated in
/// reverse order and the step error is returned. Compensation errors are
/// logged and never replace it.
pub struct Saga<C: Send + Sync> {
    name: &'static str,
    steps: Vec<Box<dyn Step<C>>>,
}

impl<C: Send + Sync> Saga<C> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            steps: Vec::new(),
        }
    }

    /// Append a step.
    pub fn step(mut self, step: impl Step<C> + 'static) -> Self {
        self.steps.push(Box::new(step));
        self
    }

    pub async fn run(&self, ctx: &mut C) -> Result<()> {
        for (position, step) in self.steps.iter().enumerate() {
            if let Err(err) = step.execute(ctx).await {
                tracing::warn!(
                    saga = self.name,
                    step = step.name(),
                    error = %err,
                    "saga step failed, compensating"
                );
                self.unwind(&self.steps[..position], ctx).await;
                return Err(err);
            }
        }

        Ok(())
    }

    async fn unwind(&self, completed: &[Box<dyn Step<C>>], ctx: &C) {
        for step in completed.iter().rev() {
            match step.compensate(ctx).await {
                Ok(()) => {
                    metrics::counter!("saga_compensations_total", "outcome" => "success")
                        .increment(1);
                },
                Err(err) => {
                    metrics::counter!("saga_compensations_total", "outcome" => "failure")
                        .increment(1);
                    tracing::error!(
                        saga = self.name,
                        step = step.name(),
                        error = %err,
                        "compensation failed, manual repair required"
                    );
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::error::ServerError;

    #[derive(Default)]
    struct Journal(Mutex<Vec<String>>);

    impl Journal {
        fn push(&self, entry: String) {
            self.0.lock().unwrap().push(entry);
        }
    }

    struct Recorded {
        name: &'static str,
        fail: bool,
        fail_compensation: bool,
    }

    impl Recorded {
        fn ok(name: &'static str) -> Self {
            Self {
                name,
                fail: false,
                fail_compensation: false,
            }
        }
    }

    #[async_trait]
    impl Step<Journal> for Recorded {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn execute(&self, ctx: &mut Journal) -> Result<()> {
            if self.fail {
                return Err(ServerError::Conflict);
            }
            ctx.push(format!("do {}", self.name));
            Ok(())
        }

        async fn compensate(&self, ctx: &Journal) -> Result<()> {
            ctx.push(format!("undo {}", self.name));
            if self.fail_compensation {
                return Err(ServerError::NotFound);
            }
            Ok(())
        }
    }

    fn entries(journal: Journal) -> Vec<String> {
        journal.0.into_inner().unwrap()
    }

    #[tokio::test]
    async fn test_all_steps_succeed() {
        let saga = Saga::new("test")
            .step(Recorded::ok("a"))
            .step(Recorded::ok("b"));
        let mut journal = Journal::default();

        saga.run(&mut journal).await.unwrap();
        assert_eq!(entries(journal), ["do a", "do b"]);
    }

    #[tokio::test]
    async fn test_unwind_in_reverse_order() {
        let saga = Saga::new("test")
            .step(Recorded::ok("a"))
            .step(Recorded::ok("b"))
            .step(Recorded {
                name: "c",
                fail: true,
                fail_compensation: false,
            });
        let mut journal = Journal::default();

        let err = saga.run(&mut journal).await.unwrap_err();
        assert!(matches!(err, ServerError::Conflict));
        // the failed step itself is not compensated.
        assert_eq!(entries(journal), ["do a", "do b", "undo b", "undo a"]);
    }

    #[tokio::test]
    async fn test_compensation_failure_keeps_original_error() {
        let saga = Saga::new("test")
            .step(Recorded {
                name: "a",
                fail: false,
                fail_compensation: true,
            })
            .step(Recorded {
                name: "b",
                fail: true,
                fail_compensation: false,
            });
        let mut journal = Journal::default();

        let err = saga.run(&mut journal).await.unwrap_err();
        assert!(matches!(err, ServerError::Conflict));
        assert_eq!(entries(journal), ["do a", "undo a"]);
    }
}
