//! Value objects and typed identifiers.
//!
//! Value objects compare by the ordered list of components they declare
//! through [`ValueObject::equality_components`]; [`value_object_eq!`] derives
//! `PartialEq`, `Eq` and `Hash` from that list so the three always agree.
//!
//! Identifiers wrap a single primitive and expose a well-defined "empty"
//! sentinel (nil UUID, blank string, zero). Aggregate roots refuse to be
//! constructed around an empty identifier.

use std::{fmt, hash::Hash};

use uuid::Uuid;

/// Structural equality through an ordered tuple of components.
///
/// ```
/// use chronicle_core::{id::ValueObject, value_object_eq};
///
/// #[derive(Debug, Clone)]
/// struct Money {
///     amount: i64,
///     currency: String,
/// }
///
/// impl ValueObject for Money {
///     type Components<'a> = (&'a i64, &'a str);
///
///     fn equality_components(&self) -> Self::Components<'_> {
///         (&self.amount, self.currency.as_str())
///     }
/// }
///
/// value_object_eq!(Money);
///
/// let a = Money { amount: 5, currency: "EUR".into() };
/// assert_eq!(a, a.clone());
/// ```
pub trait ValueObject {
    /// Borrowed view of the fields that define equality, in declaration
    /// order.
    type Components<'a>: Eq + Hash
    where
        Self: 'a;

    fn equality_components(&self) -> Self::Components<'_>;
}

/// Implement `PartialEq`, `Eq` and `Hash` for a [`ValueObject`] in terms of
/// its equality components.
#[macro_export]
macro_rules! value_object_eq {
    ($ty:ty) => {
        impl ::core::cmp::PartialEq for $ty {
            fn eq(&self, other: &Self) -> bool {
                $crate::id::ValueObject::equality_components(self)
                    == $crate::id::ValueObject::equality_components(other)
            }
        }

        impl ::core::cmp::Eq for $ty {}

        impl ::core::hash::Hash for $ty {
            fn hash<H: ::core::hash::Hasher>(&self, state: &mut H) {
                ::core::hash::Hash::hash(
                    &$crate::id::ValueObject::equality_components(self),
                    state,
                );
            }
        }
    };
}

/// Aggregate identifier contract.
///
/// Equality and hashing come from the wrapped value. [`Identifier::empty`]
/// returns the sentinel and [`Identifier::is_empty`] detects it.
pub trait Identifier:
    Clone + Eq + Hash + fmt::Debug + fmt::Display + Send + Sync + 'static
{
    /// The sentinel value that never identifies a real aggregate.
    fn empty() -> Self;

    fn is_empty(&self) -> bool;
}

impl Identifier for Uuid {
    fn empty() -> Self {
        Self::nil()
    }

    fn is_empty(&self) -> bool {
        self.is_nil()
    }
}

impl Identifier for String {
    fn empty() -> Self {
        Self::new()
    }

    // Whitespace-only keys count as blank.
    fn is_empty(&self) -> bool {
        self.trim().is_empty()
    }
}

impl Identifier for u64 {
    fn empty() -> Self {
        0
    }

    fn is_empty(&self) -> bool {
        *self == 0
    }
}

impl Identifier for i64 {
    fn empty() -> Self {
        0
    }

    fn is_empty(&self) -> bool {
        *self == 0
    }
}

/// Declare a newtype identifier over one of the primitive identifier types.
///
/// The generated type implements [`Identifier`] (delegating the sentinel to
/// the wrapped value), `Display`, `From<inner>`, and transparent serde
/// (de)serialization.
///
/// ```
/// use chronicle_core::{id::Identifier, typed_id};
///
/// typed_id! {
///     /// Identifies a blog post.
///     pub struct PostId(uuid::Uuid);
/// }
///
/// assert!(PostId::empty().is_empty());
/// assert!(!PostId::generate().is_empty());
/// ```
#[macro_export]
macro_rules! typed_id {
    (@base $(#[$meta:meta])* $vis:vis struct $name:ident($inner:ty);) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
        $vis struct $name($inner);

        impl $name {
            #[must_use]
            pub const fn new(value: $inner) -> Self {
                Self(value)
            }

            #[must_use]
            pub const fn as_inner(&self) -> &$inner {
                &self.0
            }

            #[must_use]
            pub fn into_inner(self) -> $inner {
                self.0
            }
        }

        impl $crate::id::Identifier for $name {
            fn empty() -> Self {
                Self(<$inner as $crate::id::Identifier>::empty())
            }

            fn is_empty(&self) -> bool {
                <$inner as $crate::id::Identifier>::is_empty(&self.0)
            }
        }

        impl ::core::fmt::Display for $name {
            fn fmt(&self, f: &mut ::core::fmt::Formatter<'_>) -> ::core::fmt::Result {
                ::core::fmt::Display::fmt(&self.0, f)
            }
        }

        impl ::core::convert::From<$inner> for $name {
            fn from(value: $inner) -> Self {
                Self(value)
            }
        }

        impl $crate::__private::serde::Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> ::core::result::Result<S::Ok, S::Error>
            where
                S: $crate::__private::serde::Serializer,
            {
                $crate::__private::serde::Serialize::serialize(&self.0, serializer)
            }
        }

        impl<'de> $crate::__private::serde::Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> ::core::result::Result<Self, D::Error>
            where
                D: $crate::__private::serde::Deserializer<'de>,
            {
                <$inner as $crate::__private::serde::Deserialize<'de>>::deserialize(deserializer)
                    .map(Self)
            }
        }
    };
    ($(#[$meta:meta])* $vis:vis struct $name:ident(uuid::Uuid);) => {
        $crate::typed_id!(@base $(#[$meta])* $vis struct $name($crate::__private::uuid::Uuid););

        impl $name {
            /// Generate a fresh time-ordered identifier.
            #[must_use]
            pub fn generate() -> Self {
                Self($crate::__private::uuid::Uuid::now_v7())
            }
        }
    };
    ($(#[$meta:meta])* $vis:vis struct $name:ident($inner:ty);) => {
        $crate::typed_id!(@base $(#[$meta])* $vis struct $name($inner););
    };
}
