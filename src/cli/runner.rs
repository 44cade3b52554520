//! Runs a push operation from parsed arguments

use crate::cli::args::Args;
use crate::config::PushConfig;
use crate::error::{PusherError, Result};
use crate::operation::{OperationError, PushOperation, PushOperationResult};
use std::io::Write;
use tokio_util::sync::CancellationToken;
use tracing::error;

pub struct Runner {
    config: PushConfig,
}

impl Runner {
    pub fn new(args: &Args) -> Result<Self> {
        Ok(Self {
            config: args.to_config()?,
        })
    }

    /// Execute the push and print the summary to stdout.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<PushOperationResult> {
        self.run_with_output(cancel, &mut std::io::stdout()).await
    }

    /// Execute the push and write the summary to `out`, whatever the outcome.
    ///
    /// Fails when the operation stopped early or when any image failed to
    /// push, even if others succeeded.
    pub async fn run_with_output<W: Write>(
        &self,
        cancel: &CancellationToken,
        out: &mut W,
    ) -> Result<PushOperationResult> {
        let operation = PushOperation::new(self.config.clone());
        let (result, failure) = match operation.execute(cancel).await {
            Ok(result) => (result, None),
            Err(OperationError { result, error }) => (*result, Some(error)),
        };

        writeln!(out, "{}", result.summary())?;
        for push in result.results.iter().filter(|r| !r.is_success()) {
            if let Some(err) = &push.error {
                error!(image = %push.image_name, error = %err, "push failed");
            }
        }

        finish(result, failure)
    }
}

fn finish(result: PushOperationResult, failure: Option<PusherError>) -> Result<PushOperationResult> {
    if let Some(err) = failure {
        return Err(err);
    }
    if result.images_failed > 0 {
        return Err(PusherError::PushFailed {
            failed: result.images_failed,
            total: result.images_found,
        });
    }
    Ok(result)
}
