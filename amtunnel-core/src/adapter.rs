//! Interface to the terminal's application-mode escape parser.
//!
//! The parser recognises the start and end of an application-mode
//! sequence and hands the bytes in between to an [`AppModeHandler`].
//! Every call returns a [`HandlerResult`] that tells the parser whether
//! to keep delivering, hold off, or give the remaining bytes back to the
//! normal terminal output path.

use std::fmt;

/// What the caller must do after a handler consumed input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Keep delivering bytes.
    Continue,
    /// Stop delivering until the handler signals it drained.
    Pause,
    /// Leave application mode; `remaining_data` is ordinary output.
    Abort,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Continue => write!(f, "CONTINUE"),
            Action::Pause => write!(f, "PAUSE"),
            Action::Abort => write!(f, "ABORT"),
        }
    }
}

/// Outcome of one handler call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerResult {
    pub action: Action,
    /// Bytes the handler did not consume. Only set on `Abort`.
    pub remaining_data: Option<String>,
}

impl HandlerResult {
    pub fn proceed() -> Self {
        Self {
            action: Action::Continue,
            remaining_data: None,
        }
    }

    pub fn pause() -> Self {
        Self {
            action: Action::Pause,
            remaining_data: None,
        }
    }

    /// Abort, handing `remaining` back to the caller (omitted when empty).
    pub fn abort(remaining: impl Into<String>) -> Self {
        let remaining = remaining.into();
        Self {
            action: Action::Abort,
            remaining_data: (!remaining.is_empty()).then_some(remaining),
        }
    }

    pub fn is_abort(&self) -> bool {
        self.action == Action::Abort
    }
}

/// A consumer of one application-mode sequence.
pub trait AppModeHandler {
    /// Sequence started; `params` are the parameters of the start signal.
    fn handle_start(&mut self, params: &[&str]) -> HandlerResult;

    /// Body bytes of the sequence, in arrival order, arbitrarily split.
    fn handle_data(&mut self, data: &str) -> HandlerResult;

    /// Sequence ended.
    fn handle_stop(&mut self) -> HandlerResult;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abort_drops_empty_remainder() {
        assert_eq!(HandlerResult::abort("").remaining_data, None);
        assert_eq!(
            HandlerResult::abort("tail").remaining_data.as_deref(),
            Some("tail")
        );
    }

    #[test]
    fn display_matches_wire_names() {
        assert_eq!(Action::Continue.to_string(), "CONTINUE");
        assert_eq!(Action::Pause.to_string(), "PAUSE");
        assert_eq!(Action::Abort.to_string(), "ABORT");
    }
}
