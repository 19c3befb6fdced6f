/// An opaque unit of work submitted to the dispatcher.
///
/// A command carries no behavior itself — the handler registered for its
/// concrete type produces the `Output`. The association between a command
/// type and its `Output` is fixed at compile time, so a handler for a given
/// command type always produces values of that command's result type.
pub trait Command: Send + Sync + 'static {
    /// Result type produced by the handler for this command.
    type Output: Send + 'static;

    /// Per-instance timeout override, consulted first in
    /// `TimeoutController`'s resolution chain (ahead of any per-type or
    /// custom-resolver default). `None` defers to the rest of the chain.
    fn timeout_override(&self) -> Option<std::time::Duration> {
        None
    }
}
