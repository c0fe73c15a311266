use base64::Engine;
use base64::engine::general_purpose::STANDARD as b64;
use std::borrow::Cow;

/// Contains bytes of base64 encoded some other bytes.
///
/// Used for the `X-PAYMENT` request header and the `X-PAYMENT-RESPONSE`
/// response header, both of which carry base64-encoded JSON.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Base64Bytes<'a>(pub Cow<'a, [u8]>);

impl Base64Bytes<'_> {
    /// Decode base64 string bytes to raw binary payload.
    pub fn decode(&self) -> Result<Vec<u8>, base64::DecodeError> {
        b64.decode(&self.0)
    }

    /// Encode raw binary input into base64 string bytes.
    pub fn encode<T: AsRef<[u8]>>(input: T) -> Base64Bytes<'static> {
        let encoded = b64.encode(input.as_ref());
        Base64Bytes(Cow::Owned(encoded.into_bytes()))
    }

    /// The base64 text itself, for placing into a header value.
    pub fn as_str(&self) -> &str {
        // Encoded output is always ASCII.
        std::str::from_utf8(self.0.as_ref()).expect("base64 text is ASCII")
    }
}

impl AsRef<[u8]> for Base64Bytes<'_> {
    fn as_ref(&self) -> &[u8] {
        self.0.as_ref()
    }
}

impl<'a> From<&'a [u8]> for Base64Bytes<'a> {
    fn from(slice: &'a [u8]) -> Self {
        Base64Bytes(Cow::Borrowed(slice))
    }
}
