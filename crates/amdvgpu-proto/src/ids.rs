//! Typed identifiers.
//!
//! The wire format carries all of these as plain integers; the typed API never does, so a
//! context id cannot be handed to something expecting a resource id.

use core::fmt;

macro_rules! id_newtype {
    ($(#[$meta:meta])* $name:ident($inner:ty), $label:literal) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(pub $inner);

        impl $name {
            pub const fn get(self) -> $inner {
                self.0
            }
        }

        impl From<$inner> for $name {
            fn from(v: $inner) -> Self {
                Self(v)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($label, "#{}"), self.0)
            }
        }
    };
}

id_newtype!(
    /// Guest-assigned blob id carried in `RESOURCE_CREATE_BLOB` and `GEM_NEW`.
    BlobId(u64),
    "blob"
);

id_newtype!(
    /// Host resource id (virtio-gpu `res_handle`), resolved after blob creation.
    ResourceId(u32),
    "res"
);

id_newtype!(
    /// Host execution context returned by `CREATE_CTX`.
    ContextId(u32),
    "ctx"
);

id_newtype!(
    /// Guest-local GEM handle returned by the transport.
    BoHandle(u32),
    "bo"
);

id_newtype!(
    /// Per-channel request sequence number.
    SeqNo(u32),
    "seq"
);

impl BlobId {
    /// The single id reserved for the channel's shared control blob.
    pub const CONTROL: BlobId = BlobId(0);

    pub const fn is_control(self) -> bool {
        self.0 == 0
    }
}
