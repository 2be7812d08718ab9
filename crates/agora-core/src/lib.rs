pub mod bincode;
pub mod event;

#[macro_export]
macro_rules! define_array_type {
    (
        $(#[$outer:meta])*
        struct $t:tt, $n:literal
    ) => {
        $(#[$outer])*
        #[derive(::serde::Serialize, ::serde::Deserialize)]
        #[derive(::bincode::Encode, ::bincode::Decode)]
        #[derive(Copy, Clone, Hash, Debug)]
        pub struct $t([u8; $n]);

        impl $t {
            pub fn as_slice(&self) -> &[u8] {
                self.0.as_slice()
            }
        }
    }
}

#[macro_export]
macro_rules! define_array_type_public {
    (
        $(#[$outer:meta])*
        struct $t:tt, $n:literal
    ) => {
        $crate::define_array_type!(
            #[derive(PartialOrd, Ord, PartialEq, Eq)]
            $(#[$outer])*
            struct $t, $n
        );
    };
}

macro_rules! impl_base32_str {
    (
        $t:tt
    ) => {
        impl std::fmt::Display for $t {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                data_encoding::BASE32_NOPAD.encode_write(self.as_slice(), f)
            }
        }

        impl std::str::FromStr for $t {
            type Err = data_encoding::DecodeError;

            fn from_str(s: &str) -> Result<$t, Self::Err> {
                let v = data_encoding::BASE32_NOPAD.decode(s.as_bytes())?;
                let a = v.try_into().map_err(|_| data_encoding::DecodeError {
                    position: 0,
                    kind: data_encoding::DecodeKind::Length,
                })?;
                Ok(Self(a))
            }
        }
    };
}

#[macro_export]
macro_rules! impl_zero_max {
    ($name:tt, $n:literal) => {
        impl $name {
            pub const ZERO: Self = Self([0; $n]);
            pub const MAX: Self = Self([0xff; $n]);
        }
    };
}

define_array_type_public!(
    /// Content id of an [`event::Event`]: blake3 over the canonical
    /// encoding of the envelope's immutable fields.
    struct EventId, 32
);
impl_base32_str!(EventId);
impl_zero_max!(EventId, 32);

impl From<blake3::Hash> for EventId {
    fn from(value: blake3::Hash) -> Self {
        Self(value.as_bytes()[..32].try_into().expect("Must be 32 bytes"))
    }
}

impl From<EventId> for [u8; 32] {
    fn from(value: EventId) -> Self {
        value.0
    }
}

define_array_type_public!(
    /// [`ShortEventId`] is short (16B) because it is always used in the
    /// context of a known topic, where grinding collisions gains an
    /// attacker nothing they could not get by publishing normally.
    ///
    /// One might think of a `FullEventId` = `(TopicId, EventId)`, where
    /// the topic is passed separately or known from the context.
    struct ShortEventId, 16
);
impl_base32_str!(ShortEventId);
impl_zero_max!(ShortEventId, 16);

impl Default for ShortEventId {
    fn default() -> Self {
        Self::ZERO
    }
}

impl From<EventId> for ShortEventId {
    fn from(value: EventId) -> Self {
        Self(value.0[..16].try_into().expect("Must be 16 bytes"))
    }
}

impl From<ShortEventId> for [u8; 16] {
    fn from(value: ShortEventId) -> Self {
        value.0
    }
}

define_array_type_public!(
    /// Fixed-size table-key form of a topic name (16B of blake3)
    ///
    /// The human-readable name travels inside the envelope; this is what
    /// indices and channels key on.
    struct TopicId, 16
);
impl_base32_str!(TopicId);
impl_zero_max!(TopicId, 16);

impl TopicId {
    pub fn from_name(name: &str) -> Self {
        let hash = blake3::hash(name.as_bytes());
        Self(hash.as_bytes()[..16].try_into().expect("Must be 16 bytes"))
    }
}

/// Caller-supplied envelope timestamp, microseconds
///
/// The core has no clock authority: ordering stability across replicas
/// depends on publishers supplying deterministic values.
#[derive(::serde::Serialize, ::serde::Deserialize)]
#[derive(::bincode::Encode, ::bincode::Decode)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Timestamp(u64);

impl Timestamp {
    pub const ZERO: Self = Self(0);
    pub const MAX: Self = Self(u64::MAX);

    pub fn as_micros(self) -> u64 {
        self.0
    }
}

impl From<u64> for Timestamp {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<Timestamp> for u64 {
    fn from(value: Timestamp) -> Self {
        value.0
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}
