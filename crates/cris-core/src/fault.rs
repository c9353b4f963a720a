//! Unexpected faults raised by validators, handlers and hooks.

use std::any::Any;
use std::fmt;

use crate::message::{MessageCollector, UserMessage};

/// Error chain of a caught `Err` or panic, outermost first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Fault {
    chain: Vec<String>,
}

impl Fault {
    pub(crate) fn from_error(error: &anyhow::Error) -> Self {
        Self {
            chain: error.chain().map(ToString::to_string).collect(),
        }
    }

    pub(crate) fn from_panic(payload: &(dyn Any + Send)) -> Self {
        let text = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "panic with a non-string payload".to_string()
        };
        Self { chain: vec![text] }
    }

    /// Outermost message.
    pub(crate) fn message(&self) -> &str {
        self.chain.first().map(String::as_str).unwrap_or_default()
    }

    /// Push `chain[skip..]` as Error messages nested by position.
    pub(crate) fn push_chain(&self, skip: usize, messages: &mut MessageCollector) {
        for (depth, text) in self.chain.iter().enumerate().skip(skip) {
            let depth = u16::try_from(depth).unwrap_or(u16::MAX);
            messages.push(UserMessage::error(text.clone()).with_depth(depth));
        }
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.chain.join(": "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn test_chain_is_outermost_first() {
        let err = Err::<(), _>(anyhow::anyhow!("disk full"))
            .context("saving order")
            .unwrap_err();
        let fault = Fault::from_error(&err);
        assert_eq!(fault.message(), "saving order");
        assert_eq!(fault.to_string(), "saving order: disk full");

        let mut messages = MessageCollector::new();
        fault.push_chain(0, &mut messages);
        let depths: Vec<_> = messages.messages().iter().map(|m| m.depth).collect();
        assert_eq!(depths, [0, 1]);
    }

    #[test]
    fn test_panic_payloads() {
        let boxed: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(Fault::from_panic(boxed.as_ref()).message(), "boom");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(Fault::from_panic(boxed.as_ref()).message(), "bang");
        let boxed: Box<dyn Any + Send> = Box::new(42_u8);
        assert!(Fault::from_panic(boxed.as_ref()).message().contains("non-string"));
    }
}
