//! Hook run before every pacer cycle so receiver-side losses reach the
//! encoder. Best effort: the pacer logs failures and carries on.

use anyhow::Result;
use uvr_transport::FeedbackListener;

pub trait SessionFeedback: Send {
    fn poll(&mut self) -> Result<()>;
}

/// For sessions whose receiver shares the recovery signal directly.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoFeedback;

impl SessionFeedback for NoFeedback {
    fn poll(&mut self) -> Result<()> {
        Ok(())
    }
}

impl SessionFeedback for FeedbackListener {
    fn poll(&mut self) -> Result<()> {
        FeedbackListener::poll(self)?;
        Ok(())
    }
}

impl<F: SessionFeedback> SessionFeedback for Option<F> {
    fn poll(&mut self) -> Result<()> {
        match self {
            Some(feedback) => feedback.poll(),
            None => Ok(()),
        }
    }
}
