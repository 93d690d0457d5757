//! Streaming/download support types. Streaming and download are distinct
//! operations from a plain `send`: both drive the same transfer pump, but
//! `stream` hands chunks to a caller callback as they arrive and settles
//! with headers only, while `download` writes the body straight to a file
//! and settles with its final size.

use std::cell::RefCell;
use std::rc::Rc;

/// Shared chunk sink installed on the `curl` collector so `write()` can call
/// into caller code without the pump depending on `client`.
pub type ChunkSink = Rc<RefCell<dyn FnMut(&[u8])>>;

pub fn chunk_sink(f: impl FnMut(&[u8]) + 'static) -> ChunkSink {
    Rc::new(RefCell::new(f))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_sink_shares_mutation_with_the_caller_across_clones() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let seen_inner = seen.clone();
        let sink = chunk_sink(move |chunk: &[u8]| seen_inner.borrow_mut().extend_from_slice(chunk));

        (sink.borrow_mut())(b"a");
        (sink.borrow_mut())(b"bc");

        assert_eq!(*seen.borrow(), b"abc");
    }
}
