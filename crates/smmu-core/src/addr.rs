use crate::PageLevel;

/// Shift between a physical address and its frame number.
pub const PAGE_SHIFT: u64 = 12;

/// Size of the smallest translation unit in bytes.
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;

macro_rules! impl_addr {
    ($name:ident, $doc:expr) => {
        #[doc = concat!("A ", $doc, ".")]
        #[derive(
            Default,
            Clone,
            Copy,
            PartialEq,
            Eq,
            PartialOrd,
            Ord,
            Hash,
            ::serde::Serialize,
            ::serde::Deserialize,
        )]
        pub struct $name(pub u64);

        impl $name {
            #[doc = concat!("Creates a new instance of the `", stringify!($name), "` type.")]
            pub const fn new(value: u64) -> Self {
                Self(value)
            }
        }

        impl From<u64> for $name {
            fn from(value: u64) -> Self {
                Self(value)
            }
        }

        impl From<$name> for u64 {
            fn from(value: $name) -> u64 {
                value.0
            }
        }

        impl ::std::ops::Add<u64> for $name {
            type Output = $name;

            fn add(self, rhs: u64) -> Self::Output {
                Self(self.0 + rhs)
            }
        }

        impl ::std::ops::Sub<u64> for $name {
            type Output = $name;

            fn sub(self, rhs: u64) -> Self::Output {
                Self(self.0 - rhs)
            }
        }

        impl ::std::ops::Sub<$name> for $name {
            type Output = u64;

            fn sub(self, rhs: $name) -> Self::Output {
                self.0 - rhs.0
            }
        }

        impl ::std::ops::BitAnd<u64> for $name {
            type Output = $name;

            fn bitand(self, rhs: u64) -> Self::Output {
                Self(self.0 & rhs)
            }
        }

        impl ::std::ops::BitOr<u64> for $name {
            type Output = $name;

            fn bitor(self, rhs: u64) -> Self::Output {
                Self(self.0 | rhs)
            }
        }

        impl ::std::fmt::Debug for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter) -> ::std::fmt::Result {
                write!(f, "0x{:x}", self.0)
            }
        }

        impl ::std::fmt::Display for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter) -> ::std::fmt::Result {
                write!(f, "0x{:x}", self.0)
            }
        }

        impl ::std::fmt::LowerHex for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter) -> ::std::fmt::Result {
                ::std::fmt::LowerHex::fmt(&self.0, f)
            }
        }
    };
}

impl_addr!(Gpa, "guest physical address");
impl_addr!(Gfn, "guest frame number");
impl_addr!(Hpa, "host physical address");
impl_addr!(Hfn, "host frame number");

/// Returns the guest frame number containing a guest physical address.
pub const fn gfn_from_gpa(gpa: Gpa) -> Gfn {
    Gfn(gpa.0 >> PAGE_SHIFT)
}

/// Returns the guest physical address of the first byte of a frame.
pub const fn gpa_from_gfn(gfn: Gfn) -> Gpa {
    Gpa(gfn.0 << PAGE_SHIFT)
}

/// Rounds a guest frame number down to the mapping boundary of `level`.
///
/// A leaf at `level` covers `level.pages()` frames; every frame in that range
/// shares the same rounded GFN.
pub const fn gfn_round_for_level(gfn: Gfn, level: PageLevel) -> Gfn {
    Gfn(gfn.0 & !(level.pages() - 1))
}
