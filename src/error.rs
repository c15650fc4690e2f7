//! Crate-wide error type.
//!
//! Contract violations (misuse of the range-tree API, unaligned sizes,
//! double frees, allocating while a metaslab is condensing) are programming
//! errors. Per the allocator's error model they are never retried or
//! recovered from, so they `panic!`/`debug_assert!` rather than flow through
//! [`Error`].

error_chain::error_chain! {
    errors {
        /// No allocation could be made in any eligible group after all
        /// rotor retries.
        NoSpace {
            description("no space available for allocation")
        }
        /// A space-map load failed.
        Io {
            description("space map i/o error")
        }
        /// `claim` was called on a range that is not currently free.
        NotFound {
            description("requested range is not free")
        }
        /// A DVA names a vdev or metaslab that does not exist.
        Invalid(msg: String) {
            description("invalid vdev or metaslab reference")
            display("invalid reference: {}", msg)
        }
    }
}
