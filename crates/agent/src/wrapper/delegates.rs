//! Ready-made continuations for the common segment-ending patterns.

use std::any::Any;
use std::sync::Arc;

use tracing::debug;

use crate::agent::Agent;
use crate::completion::Completion;
use crate::segment::Segment;
use crate::transaction::Transaction;
use crate::wrapper::{AfterCall, Value};

/// Ends the segment when the call returns, whether it succeeded or failed.
pub fn for_segment(segment: Arc<Segment>) -> AfterCall {
    let on_failure = Arc::clone(&segment);
    AfterCall::new(move |_| segment.end(), move |_| on_failure.end())
}

/// For calls returning a `Completion<T>`. The failure path ends the segment;
/// the success path hands the completion to `on_success`, which becomes
/// responsible for ending it. A return value of any other type ends the
/// segment immediately.
pub fn for_completion<T, F>(segment: Arc<Segment>, on_success: F) -> AfterCall
where
    T: Any + Send + Sync,
    F: FnOnce(&Completion<T>) + Send + 'static,
{
    let on_failure = Arc::clone(&segment);
    AfterCall::new(
        move |value: &Value| match value.downcast_ref::<Completion<T>>() {
            Some(completion) => on_success(completion),
            None => {
                debug!(segment = %segment.id(), "no completion returned; ending segment");
                segment.end();
            }
        },
        move |_| on_failure.end(),
    )
}

/// The canonical asynchronous pattern: on return, take the segment off the
/// call stack and hold the transaction; when the completion resolves, end
/// the segment and release.
pub fn for_async_segment<T>(
    agent: &Agent,
    transaction: &Transaction,
    segment: Arc<Segment>,
) -> AfterCall
where
    T: Any + Send + Sync,
{
    let agent = agent.clone();
    let transaction = transaction.clone();
    let inner = Arc::clone(&segment);
    for_completion::<T, _>(segment, move |completion| {
        inner.remove_from_call_stack();
        let held = transaction.hold();
        completion.on_complete(move |_| end_and_release(&agent, &transaction, &inner, held));
    })
}

/// Ends the segment and drops the hold taken for it, each inside its own
/// exception boundary. The release runs even if ending the segment fails,
/// and a failing finalize never unwinds into the completing thread.
pub fn end_and_release(agent: &Agent, transaction: &Transaction, segment: &Segment, held: bool) {
    agent.handle_exceptions(|| {
        segment.end();
        Ok(())
    });
    if held {
        agent.handle_exceptions(|| {
            transaction.release();
            Ok(())
        });
    }
}
