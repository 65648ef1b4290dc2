// SPDX-License-Identifier: MIT OR Apache-2.0
//! Message bodies and the version-gated message declaration macro.

use std::fmt;

use super::stream::{StreamInput, StreamOutput};
use crate::error::Result;

/// A message body with a field-by-field wire encoding.
///
/// Decoding happens into an existing instance, so a handler's blank
/// prototype can be filled in place.
pub trait Streamable {
    /// # Errors
    ///
    /// Returns `Serialization` if the message cannot be encoded.
    fn write_to(&self, out: &mut StreamOutput) -> Result<()>;

    /// # Errors
    ///
    /// Returns `Serialization` if the stream is truncated or malformed.
    fn read_from(&mut self, input: &mut StreamInput<'_>) -> Result<()>;
}

/// Declares a flat message struct together with its `Streamable` impl.
///
/// Each field names the version it first appeared in. Encode and decode are
/// both generated from that single list, so a field is gated by the same
/// predicate on both paths. A field absent at the stream version keeps its
/// `Default` value on decode.
///
/// ```
/// use cluster_transport::{versioned_message, Version};
///
/// const V_2: Version = Version::from_id(2);
///
/// versioned_message! {
///     pub struct Ping {
///         pub seq: i64 => since Version::V_0,
///         pub sender: String => since V_2,
///     }
/// }
///
/// assert_eq!(Ping::FIELDS.len(), 2);
/// ```
#[macro_export]
macro_rules! versioned_message {
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident {
            $(
                $(#[$fmeta:meta])*
                $fvis:vis $field:ident : $ty:ty => since $since:expr
            ),* $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Default, PartialEq)]
        $vis struct $name {
            $(
                $(#[$fmeta])*
                $fvis $field: $ty,
            )*
        }

        impl $name {
            /// Wire fields in encoding order with the version each first appeared in.
            pub const FIELDS: &'static [(&'static str, $crate::node::Version)] =
                &[$((stringify!($field), $since)),*];
        }

        impl $crate::codec::Streamable for $name {
            fn write_to(
                &self,
                out: &mut $crate::codec::StreamOutput,
            ) -> $crate::error::Result<()> {
                let _ = &out;
                $(out.write_gated($since, &self.$field);)*
                Ok(())
            }

            fn read_from(
                &mut self,
                input: &mut $crate::codec::StreamInput<'_>,
            ) -> $crate::error::Result<()> {
                let _ = &input;
                $(input.read_gated($since, &mut self.$field)?;)*
                Ok(())
            }
        }
    };
}

versioned_message! {
    /// Message with no body.
    pub struct EmptyMessage {}
}

versioned_message! {
    /// Message carrying a single string.
    pub struct StringMessage {
        pub message: String => since crate::node::Version::V_0,
    }
}

impl StringMessage {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Body of an error response: the failure raised on the remote node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteError {
    /// Coarse failure kind, e.g. `handler_failure` or `action_not_found`.
    pub error_type: String,
    pub message: String,
    /// Node the failure happened on.
    pub node: String,
    pub action: String,
}

impl RemoteError {
    pub fn new(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error_type: error_type.into(),
            message: message.into(),
            node: String::new(),
            action: String::new(),
        }
    }

    #[must_use]
    pub fn with_origin(mut self, node: impl Into<String>, action: impl Into<String>) -> Self {
        self.node = node.into();
        self.action = action.into();
        self
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for RemoteError {}

impl Streamable for RemoteError {
    fn write_to(&self, out: &mut StreamOutput) -> Result<()> {
        out.write_string(&self.error_type);
        out.write_string(&self.message);
        out.write_string(&self.node);
        out.write_string(&self.action);
        Ok(())
    }

    fn read_from(&mut self, input: &mut StreamInput<'_>) -> Result<()> {
        self.error_type = input.read_string()?;
        self.message = input.read_string()?;
        self.node = input.read_string()?;
        self.action = input.read_string()?;
        Ok(())
    }
}
