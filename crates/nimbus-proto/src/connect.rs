//! Data-stream request/response messages.
//!
//! Each remote-initiated stream carries one `ConnectRequest` (preamble +
//! Cap'n Proto struct, followed by any request body bytes) and receives one
//! `ConnectResponse` (preamble + struct, followed by the response body).
//! HTTP semantics ride in the metadata list: `HttpMethod`, `HttpHost` and
//! `HttpHeader:<Name>` on requests; `HttpStatus` and `HttpHeader:<Name>` on
//! responses.

use crate::codec::{
    Builder, CodecError, Reader, ELEM_COMPOSITE, ENCODE_SCRATCH, WORD,
};
use crate::frame;
use crate::types::{ConnectionType, Metadata, MAX_METADATA_ENTRIES};
use tracing::warn;

/// Metadata key carrying the request method verb.
pub const META_HTTP_METHOD: &str = "HttpMethod";

/// Metadata key carrying the original host header.
pub const META_HTTP_HOST: &str = "HttpHost";

/// Metadata key carrying the response status code.
pub const META_HTTP_STATUS: &str = "HttpStatus";

/// Prefix of metadata keys carrying forwarded HTTP headers.
pub const META_HTTP_HEADER_PREFIX: &str = "HttpHeader:";

/// A request received from the edge on a data stream.
///
/// Schema: 1 data word (`type` enum at bytes `[0..2]`), 2 pointers
/// (`dest` text, `metadata` composite list).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub conn_type: ConnectionType,
    /// Request path for HTTP connections.
    pub dest: String,
    pub metadata: Vec<Metadata>,
}

impl ConnectRequest {
    /// Decodes a request from the Cap'n Proto bytes following the preamble.
    pub fn decode(capnp: &[u8]) -> Result<Self, CodecError> {
        let r = Reader::new(capnp)?;
        let root = r
            .read_struct_ptr(0)?
            .ok_or(CodecError::PointerOutOfBounds(0))?;

        let conn_type = ConnectionType::from_wire(r.read_u16(root.data_off, 0));

        let dest = if root.ptr_count >= 1 {
            String::from_utf8_lossy(r.read_text(root.ptr_off(0))?).into_owned()
        } else {
            String::new()
        };

        let mut metadata = Vec::new();
        if root.ptr_count >= 2 {
            if let Some(list) = r.read_list_ptr(root.ptr_off(1))? {
                if list.elem_size != ELEM_COMPOSITE {
                    return Err(CodecError::NotComposite(list.elem_size));
                }
                let shape = r.read_composite_shape(&list)?;
                let count = shape.elem_count as usize;
                if count > MAX_METADATA_ENTRIES {
                    warn!(
                        entries = count,
                        "metadata list over limit, keeping first {MAX_METADATA_ENTRIES}"
                    );
                }
                for i in 0..count.min(MAX_METADATA_ENTRIES) {
                    let elem = list.data_off + WORD + i * shape.stride();
                    let ptrs = elem + shape.data_words as usize * WORD;
                    let key = String::from_utf8_lossy(r.read_text(ptrs)?).into_owned();
                    let value = String::from_utf8_lossy(r.read_text(ptrs + WORD)?).into_owned();
                    let (entry, truncated) = Metadata::bounded(&key, &value);
                    if truncated {
                        warn!(key = %entry.key, "metadata entry truncated to protocol limits");
                    }
                    metadata.push(entry);
                }
            }
        }

        Ok(Self {
            conn_type,
            dest,
            metadata,
        })
    }

    /// Looks up a metadata value by exact key.
    pub fn metadata_value(&self, key: &str) -> Option<&str> {
        self.metadata
            .iter()
            .find(|m| m.key == key)
            .map(|m| m.value.as_str())
    }

    pub fn method(&self) -> Option<&str> {
        self.metadata_value(META_HTTP_METHOD)
    }

    pub fn host(&self) -> Option<&str> {
        self.metadata_value(META_HTTP_HOST)
    }

    /// Iterates forwarded HTTP headers with the `HttpHeader:` prefix removed.
    pub fn forwarded_headers(&self) -> impl Iterator<Item = (&str, &str)> {
        self.metadata.iter().filter_map(|m| {
            m.key
                .strip_prefix(META_HTTP_HEADER_PREFIX)
                .map(|name| (name, m.value.as_str()))
        })
    }
}

/// A response sent back to the edge on a data stream.
///
/// Schema: 0 data words, 2 pointers (`error` text — empty means success —
/// and the metadata composite list).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectResponse {
    pub error: String,
    pub metadata: Vec<Metadata>,
}

impl ConnectResponse {
    /// Builds the response describing an origin HTTP result: an `HttpStatus`
    /// entry followed by one `HttpHeader:<Name>` entry per header. Entries
    /// past the metadata limit are dropped.
    pub fn from_origin(status: u16, headers: &[(String, String)]) -> Self {
        let mut metadata = Vec::with_capacity((1 + headers.len()).min(MAX_METADATA_ENTRIES));
        metadata.push(Metadata {
            key: META_HTTP_STATUS.to_string(),
            value: status.to_string(),
        });
        for (name, value) in headers {
            if metadata.len() >= MAX_METADATA_ENTRIES {
                warn!(
                    dropped = headers.len() + 1 - MAX_METADATA_ENTRIES,
                    "response metadata over limit, dropping remaining headers"
                );
                break;
            }
            let (entry, truncated) =
                Metadata::bounded(&format!("{META_HTTP_HEADER_PREFIX}{name}"), value);
            if truncated {
                warn!(key = %entry.key, "response header truncated to protocol limits");
            }
            metadata.push(entry);
        }
        Self {
            error: String::new(),
            metadata,
        }
    }

    /// Encodes the full wire message: preamble + Cap'n Proto struct.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let mut b = Builder::new(ENCODE_SCRATCH);

        let rp = b.alloc(1)?;
        let root = b.alloc(2)?;
        b.write_struct_ptr(rp, root, 0, 2);
        b.write_text(root, &self.error)?;

        if !self.metadata.is_empty() {
            let n = self.metadata.len().min(MAX_METADATA_ENTRIES);
            let (elem_dw, elem_pc) = (0u16, 2u16);
            let elem_words = (elem_dw + elem_pc) as usize;
            let body_words = 1 + n * elem_words;

            let list = b.alloc(body_words)?;
            b.write_composite_tag(list, n as u32, elem_dw, elem_pc);
            b.write_list_ptr(root + WORD, list, ELEM_COMPOSITE, body_words as u32);

            for (i, entry) in self.metadata.iter().take(n).enumerate() {
                let elem = list + WORD + i * elem_words * WORD;
                b.write_text(elem, &entry.key)?;
                b.write_text(elem + WORD, &entry.value)?;
            }
        }

        let mut wire = Vec::with_capacity(frame::PREAMBLE_LEN + ENCODE_SCRATCH);
        frame::write_preamble(&mut wire);
        wire.extend_from_slice(&b.finalize());
        Ok(wire)
    }
}
