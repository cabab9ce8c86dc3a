/// Behavioral options for a [`BatchDb`](crate::db::BatchDb) handle.
#[derive(Debug, Clone, Copy, Default)]
pub struct BatchOptions {
    /// Shield non-batch exec-class calls from caller cancellation.
    ///
    /// When set, a cancelled caller no longer interrupts a statement the
    /// server is already executing (which can leave the server holding a
    /// lock); only pool acquisition remains cancellable. The shield does
    /// not apply to in-progress transactions or prepared statements.
    pub without_cancel: bool,
}

impl BatchOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_without_cancel(mut self, without_cancel: bool) -> Self {
        self.without_cancel = without_cancel;
        self
    }
}

/// Fluent builder for [`BatchOptions`].
#[derive(Debug, Clone, Default)]
pub struct BatchOptionsBuilder {
    opts: BatchOptions,
}

impl BatchOptionsBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn without_cancel(mut self, without_cancel: bool) -> Self {
        self.opts.without_cancel = without_cancel;
        self
    }

    #[must_use]
    pub fn finish(self) -> BatchOptions {
        self.opts
    }
}
