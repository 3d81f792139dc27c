use std::io;

/// Converts a C return value to a Rust `Result`.
#[inline(always)]
pub(crate) fn from_c_ret(ret: i32) -> io::Result<()> {
    if ret == 0 {
        Ok(())
    } else {
        Err(io::Error::from_raw_os_error(ret))
    }
}

/// Converts a C return value that follows the `-1` + `errno` convention to
/// a Rust `Result`.
#[cfg_attr(not(feature = "rdma-core"), allow(dead_code))]
#[inline(always)]
pub(crate) fn from_c_errno(ret: i32) -> io::Result<()> {
    if ret == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// Converts a C return value to a Rust `Result`, logging a static
/// explanation for the error codes the callee documents. The raw code stays
/// in the returned error.
#[cfg_attr(not(feature = "rdma-core"), allow(dead_code))]
#[inline(always)]
pub(crate) fn from_c_ret_explained(
    ret: i32,
    f: impl FnOnce(i32) -> Option<&'static str>,
) -> io::Result<()> {
    if ret == 0 {
        Ok(())
    } else {
        if let Some(msg) = f(ret) {
            log::debug!("rrpma: {} (errno {})", msg, ret);
        }
        Err(io::Error::from_raw_os_error(ret))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn c_ret_conversion() {
        assert!(from_c_ret(0).is_ok());
        let err = from_c_ret(libc::EINVAL).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EINVAL));
        assert!(from_c_errno(0).is_ok());
    }

    #[test]
    fn explained_keeps_code() {
        let err = from_c_ret_explained(libc::ENOMEM, |_| Some("queue is full")).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ENOMEM));
        assert!(from_c_ret_explained(0, |_| None).is_ok());
    }
}
