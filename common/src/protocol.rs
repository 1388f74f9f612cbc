//! Wire vocabulary of the singleton channel.
//!
//! Each exchange is one request line followed by one or more reply lines, all plain
//! lowercase tokens terminated by `\n`. `stop-app` is answered with `ack` right away and
//! with `stopped` once the running instance finished its shutdown.

use core::{fmt, str::FromStr};

// Macro to define the enum from variant => string mappings
macro_rules! define_enum_with_str {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident {
            $(
                $(#[$variant_meta:meta])*
                $variant:ident => $str:literal
            ),* $(,)?
        }
    ) => {
        $(#[$meta])*
        $vis enum $name {
            $(
                $(#[$variant_meta])*
                $variant,
            )*
        }

        impl $name {
            /// The token used on the wire.
            #[must_use]
            pub const fn as_str(&self) -> &'static str {
                match *self {
                    $($name::$variant => $str,)*
                }
            }

            /// The token followed by the line terminator.
            #[must_use]
            pub fn to_line(&self) -> String {
                format!("{}\n", self.as_str())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = UnknownToken;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                match value.trim() {
                    $($str => Ok($name::$variant),)*
                    other => Err(UnknownToken(other.to_owned())),
                }
            }
        }
    };
}

/// A line on the singleton channel that matched no known token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownToken(pub String);

impl fmt::Display for UnknownToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown token {:?}", self.0)
    }
}

impl core::error::Error for UnknownToken {}

define_enum_with_str! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    /// Requests a second process may send to the running launcher.
    pub enum SingletonMessage {
        /// Stop the node and exit.
        StopApp => "stop-app",
        /// Bring the existing instance to the user's attention.
        ShowMain => "show-main",
        /// Liveness probe.
        Ping => "ping",
    }
}

define_enum_with_str! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    /// Replies written back by the running launcher.
    pub enum SingletonReply {
        /// Request accepted.
        Ack => "ack",
        /// The launcher finished stopping the node and is about to exit.
        Stopped => "stopped",
        /// Answer to [`SingletonMessage::Ping`].
        Pong => "pong",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_tokens_parse_back() {
        for msg in [
            SingletonMessage::StopApp,
            SingletonMessage::ShowMain,
            SingletonMessage::Ping,
        ] {
            assert_eq!(msg.to_line().parse::<SingletonMessage>(), Ok(msg));
        }
    }

    #[test]
    fn unknown_token_is_rejected() {
        assert_eq!(
            "reboot".parse::<SingletonMessage>(),
            Err(UnknownToken("reboot".to_owned()))
        );
        assert_eq!("".parse::<SingletonReply>(), Err(UnknownToken(String::new())));
    }

    #[test]
    fn reply_tolerates_surrounding_whitespace() {
        assert_eq!(" stopped\r\n".parse(), Ok(SingletonReply::Stopped));
    }
}
