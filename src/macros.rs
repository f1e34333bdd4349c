/// Emits a per-record trace event.
///
/// These events fire for every record on every connection, so they only
/// exist in builds with the `trace-more` feature. Otherwise the arguments are
/// discarded without being evaluated.
macro_rules! trace {
    ($($arg:tt)+) => {
        #[cfg(feature = "trace-more")]
        {
            ::tracing::trace!($($arg)+);
        }
    };
}
pub(crate) use trace;
