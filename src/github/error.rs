//! Classification of octocrab failures into [`RemoteError`] kinds.
//!
//! API responses carry a status code and GitHub's message, which
//! [`RemoteError::from_status`] classifies. Failures without a response
//! (transport, decoding) fall back to the message text; the status code is
//! recovered from the rendered error where octocrab embeds one.

use crate::remote::RemoteError;

pub fn from_octocrab(err: octocrab::Error) -> RemoteError {
    let classified = match &err {
        octocrab::Error::GitHub { source, .. } => {
            RemoteError::from_status(source.status_code.as_u16(), source.message.clone())
        }
        other => {
            let message = other.to_string();
            match extract_status_code(&message) {
                Some(code) => RemoteError::from_status(code, message),
                None => RemoteError::from_message(message),
            }
        }
    };
    classified.with_source(err)
}

/// Finds an HTTP status in a rendered error such as `... status: 502 ...`.
fn extract_status_code(message: &str) -> Option<u16> {
    let idx = message.find("status: ")?;
    let digits: String = message[idx + 8..]
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok().filter(|code| (100..600).contains(code))
}
