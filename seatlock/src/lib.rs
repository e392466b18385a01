//! `seatlockd` client library
//!
//! Bookings are sent as single text lines; every line is answered with
//! exactly one reply line.
pub mod std;
#[cfg(feature = "tokio")]
pub mod tokio;

pub use seatlock_api::{Booking, Reply};

mod error {
    use ::std::io;
    use seatlock_api::WireError;
    use thiserror::Error;

    #[derive(Error, Debug)]
    pub enum Error {
        #[error("io error: {0}")]
        Io(#[from] io::Error),
        #[error("reply decoding error: {0}")]
        Decoding(#[from] WireError),
        #[error("server closed connection")]
        Disconnected,
        #[error("invalid name: {0:?}")]
        InvalidName(String),
    }
}

pub use self::error::Error;
pub type Result<T> = ::std::result::Result<T, Error>;

/// Names travel as a single token
pub(crate) fn check_name(name: &str) -> Result<String> {
    if name.is_empty() || name.chars().any(char::is_whitespace) {
        return Err(Error::InvalidName(name.to_owned()));
    }
    Ok(name.to_owned())
}

pub(crate) fn encode_request(booking: &Booking) -> String {
    let mut line = booking.encode();
    line.push('\n');
    line
}

pub(crate) fn decode_reply(line: &str) -> Result<Reply> {
    if line.is_empty() {
        return Err(Error::Disconnected);
    }
    Ok(Reply::decode(line.trim_end())?)
}

#[test]
fn names_are_single_tokens() {
    assert_eq!(check_name("alice").unwrap(), "alice");
    assert!(matches!(check_name(""), Err(Error::InvalidName(_))));
    assert!(matches!(check_name("a b"), Err(Error::InvalidName(_))));
    assert!(matches!(check_name("a\n"), Err(Error::InvalidName(_))));
}

#[test]
fn empty_reply_means_disconnect() {
    assert!(matches!(decode_reply(""), Err(Error::Disconnected)));
    assert_eq!(decode_reply("ASSIGNED 3\n").unwrap(), Reply::Assigned(3));
    assert!(matches!(decode_reply("BOGUS\n"), Err(Error::Decoding(_))));
}
