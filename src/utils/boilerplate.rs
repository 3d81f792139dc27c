macro_rules! impl_raw_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(transparent)]
        pub struct $name(::std::num::NonZeroUsize);

        impl $name {
            /// Wrap a raw provider-defined handle value.
            #[inline]
            pub fn from_raw(raw: ::std::num::NonZeroUsize) -> Self {
                Self(raw)
            }

            /// Get the raw provider-defined handle value.
            #[inline]
            pub fn as_raw(self) -> ::std::num::NonZeroUsize {
                self.0
            }

            /// Reinterpret the handle as a pointer to a provider object.
            #[allow(dead_code)]
            #[inline]
            pub(crate) fn as_ptr<T>(self) -> *mut T {
                self.0.get() as *mut T
            }
        }

        impl<T> From<::std::ptr::NonNull<T>> for $name {
            #[inline]
            fn from(pointer: ::std::ptr::NonNull<T>) -> Self {
                // SAFETY: a non-null pointer has a non-zero address.
                Self(unsafe { ::std::num::NonZeroUsize::new_unchecked(pointer.as_ptr() as usize) })
            }
        }
    };
}
