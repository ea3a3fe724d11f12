/// Progress update callbacks
pub trait ProgressCallbacks {
    /// Initialize some progress report, `total` is unknown for chunked
    /// transfers
    fn init(&mut self, total: Option<u64>);
    /// Update some progress report
    fn update(&mut self, current: u64);
    /// Finish some progress report
    fn finish(&mut self);
}

/// An empty implementation of [ProgressCallbacks] that does nothing.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct DefaultProgressCallback;

impl ProgressCallbacks for DefaultProgressCallback {
    fn init(&mut self, _total: Option<u64>) {}
    fn update(&mut self, _current: u64) {}
    fn finish(&mut self) {}
}
