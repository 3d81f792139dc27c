/// Boilerplate for opaque provider handles.
#[macro_use]
pub(crate) mod boilerplate;

/// Provide interoperability with C return values.
#[cfg(any(test, feature = "fake", feature = "rdma-core"))]
pub(crate) mod interop;

/// Ordered teardown with first-error reporting.
pub(crate) mod teardown;
