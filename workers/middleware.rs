use std::sync::Arc;

use async_trait::async_trait;

use crate::message::Message;

/// Jobs and middleware report failure as `anyhow::Error`; whatever the retry
/// middleware does not convert into a retry attempt propagates out of the
/// chain and keeps the message unconfirmed.
pub type JobResult = Result<(), anyhow::Error>;

/// User-supplied job logic, invoked at the bottom of the middleware chain.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn perform(&self, message: &Message) -> JobResult;
}

/// One link in the chain around a job invocation. Call `next.run` to hand
/// control to the rest of the chain and observe its outcome.
#[async_trait]
pub trait Middleware: Send + Sync {
    async fn call(&self, queue: &str, message: &mut Message, next: Next<'_>) -> JobResult;
}

/// The remainder of a middleware chain, ending at the job itself.
pub struct Next<'a> {
    actions: &'a [Arc<dyn Middleware>],
    job: &'a dyn JobHandler,
}

impl<'a> Next<'a> {
    pub async fn run(self, queue: &str, message: &mut Message) -> JobResult {
        match self.actions.split_first() {
            Some((head, rest)) => {
                head.call(
                    queue,
                    message,
                    Next {
                        actions: rest,
                        job: self.job,
                    },
                )
                .await
            }
            None => self.job.perform(message).await,
        }
    }
}

/// An ordered middleware chain. Each manager gets its own copy at
/// registration time, so appending to one chain never affects another.
#[derive(Clone, Default)]
pub struct Middlewares {
    actions: Vec<Arc<dyn Middleware>>,
}

impl Middlewares {
    pub fn new(actions: Vec<Arc<dyn Middleware>>) -> Middlewares {
        Middlewares { actions }
    }

    pub fn append(&mut self, action: Arc<dyn Middleware>) {
        self.actions.push(action);
    }

    pub fn prepend(&mut self, action: Arc<dyn Middleware>) {
        self.actions.insert(0, action);
    }

    pub fn append_to_copy(&self, actions: Vec<Arc<dyn Middleware>>) -> Middlewares {
        let mut copy = self.clone();
        copy.actions.extend(actions);
        copy
    }

    pub async fn call(
        &self,
        queue: &str,
        message: &mut Message,
        job: &dyn JobHandler,
    ) -> JobResult {
        Next {
            actions: &self.actions,
            job,
        }
        .run(queue, message)
        .await
    }
}
