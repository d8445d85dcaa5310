use bytes::Bytes;

/// An opaque, already-encoded package as it crosses the plugin boundary.
///
/// The core never inspects the contents beyond the conduit's 16-byte
/// package-id prefix (§3); payload encryption, if any, is the application's
/// responsibility (§1, Non-goals).
#[derive(Clone, PartialEq, Eq)]
pub struct EncPkg {
    bytes: Bytes,
}

impl EncPkg {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        EncPkg {
            bytes: bytes.into(),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Bytes {
        self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl std::fmt::Debug for EncPkg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EncPkg({} bytes)", self.bytes.len())
    }
}

impl From<Vec<u8>> for EncPkg {
    fn from(v: Vec<u8>) -> Self {
        EncPkg::new(v)
    }
}
