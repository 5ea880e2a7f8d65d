//! Control-stream registration RPC.
//!
//! The client speaks just enough of the capability RPC protocol to register
//! itself: a Bootstrap message to acquire the root interface, a Call message
//! pipelined against that Bootstrap invoking `registerConnection` (method 0
//! on interface `0xf71695ec7fe85497`), and the Return carrying the
//! registration outcome. Everything is built by hand with [`crate::codec`]
//! primitives.

use crate::codec::{Builder, CodecError, Reader, ENCODE_SCRATCH, WORD};
use crate::types::{
    ConnectionDetails, ConnectionOptions, RegistrationError, RegistrationOutcome, TunnelAuth,
    TUNNEL_SERVER_INTERFACE_ID,
};
use thiserror::Error;

/// Outer Message union discriminants (rpc.capnp).
const MSG_CALL: u16 = 2;
const MSG_RETURN: u16 = 3;
const MSG_BOOTSTRAP: u16 = 8;

/// Return union discriminants.
const RETURN_RESULTS: u16 = 0;
const RETURN_EXCEPTION: u16 = 1;
const RETURN_CANCELED: u16 = 2;

/// ConnectionResponse union discriminants.
const RESPONSE_ERROR: u16 = 0;
const RESPONSE_DETAILS: u16 = 1;

/// Question id of the Bootstrap message.
const BOOTSTRAP_QUESTION_ID: u32 = 0;

/// Question id of the registration Call.
const CALL_QUESTION_ID: u32 = 1;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RpcError {
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("missing {0} in Return message")]
    MissingField(&'static str),

    #[error("unknown Return union discriminant {0}")]
    UnknownReturnVariant(u16),

    #[error("unknown ConnectionResponse union discriminant {0}")]
    UnknownResponseVariant(u16),
}

/// Encodes the Bootstrap message: outer Message (1 data word, 1 pointer)
/// with discriminant 8, carrying a Bootstrap struct (1 data word, 1 pointer)
/// with question id 0 and a null deprecated-object pointer.
pub fn encode_bootstrap() -> Result<Vec<u8>, CodecError> {
    let mut b = Builder::new(ENCODE_SCRATCH);

    let rp = b.alloc(1)?;
    let msg = b.alloc(1 + 1)?;
    b.write_struct_ptr(rp, msg, 1, 1);
    b.set_u16(msg, MSG_BOOTSTRAP);

    let boot = b.alloc(1 + 1)?;
    b.write_struct_ptr(msg + WORD, boot, 1, 1);
    b.set_u32(boot, BOOTSTRAP_QUESTION_ID);

    Ok(b.finalize())
}

/// Encodes the registration Call.
///
/// Call struct (3 data words, 3 pointers):
/// - data `[0..4]` question id 1, `[4..6]` method id 0, `[6..8]`
///   send-results-to discriminant 0 (caller), `[8..16]` interface id;
/// - pointer 0: MessageTarget with `which = promisedAnswer` pipelined on the
///   Bootstrap question (empty transform);
/// - pointer 1: Payload whose content is the call parameters and whose
///   capability table is null;
/// - pointer 2: null.
pub fn encode_register_call(
    auth: &TunnelAuth,
    tunnel_id: &[u8; 16],
    conn_index: u8,
    options: &ConnectionOptions,
) -> Result<Vec<u8>, CodecError> {
    let mut b = Builder::new(ENCODE_SCRATCH);

    let rp = b.alloc(1)?;
    let msg = b.alloc(1 + 1)?;
    b.write_struct_ptr(rp, msg, 1, 1);
    b.set_u16(msg, MSG_CALL);

    let call = b.alloc(3 + 3)?;
    b.write_struct_ptr(msg + WORD, call, 3, 3);
    b.set_u32(call, CALL_QUESTION_ID);
    b.set_u16(call + 4, 0); // methodId 0 = registerConnection
    b.set_u16(call + 6, 0); // sendResultsTo = caller
    b.set_u64(call + 8, TUNNEL_SERVER_INTERFACE_ID);
    let call_ptrs = call + 3 * WORD;

    // MessageTarget: which = promisedAnswer, answering the Bootstrap question.
    let target = b.alloc(1 + 1)?;
    b.write_struct_ptr(call_ptrs, target, 1, 1);
    b.set_u16(target + 4, 1); // which = promisedAnswer

    let answer = b.alloc(1 + 1)?;
    b.write_struct_ptr(target + WORD, answer, 1, 1);
    b.set_u32(answer, BOOTSTRAP_QUESTION_ID);
    // PromisedAnswer.transform stays null (empty list).

    // Payload: pointer 0 = params, pointer 1 = null capability table.
    let payload = b.alloc(2)?;
    b.write_struct_ptr(call_ptrs + WORD, payload, 0, 2);

    // registerConnection parameters (1 data word, 3 pointers).
    let params = b.alloc(1 + 3)?;
    b.write_struct_ptr(payload, params, 1, 3);
    b.set_u8(params, conn_index);
    let params_ptrs = params + WORD;

    // TunnelAuth: account tag text + tunnel secret data.
    let ta = b.alloc(2)?;
    b.write_struct_ptr(params_ptrs, ta, 0, 2);
    b.write_text(ta, &auth.account_tag)?;
    b.write_data(ta + WORD, &auth.tunnel_secret)?;

    // Tunnel identifier: 16 raw bytes.
    b.write_data(params_ptrs + WORD, tunnel_id)?;

    // ConnectionOptions (1 data word, 2 pointers).
    let co = b.alloc(1 + 2)?;
    b.write_struct_ptr(params_ptrs + 2 * WORD, co, 1, 2);
    if options.replace_existing {
        b.set_bit(co, 0);
    }
    b.set_u8(co + 1, options.compression_quality);
    b.set_u8(co + 2, options.num_previous_attempts);
    let co_ptrs = co + WORD;

    // ClientInfo (0 data words, 4 pointers): id, features (null), version, arch.
    let ci = b.alloc(4)?;
    b.write_struct_ptr(co_ptrs, ci, 0, 4);
    b.write_data(ci, &options.client_id)?;
    b.write_text(ci + 2 * WORD, &options.version)?;
    b.write_text(ci + 3 * WORD, &options.arch)?;
    // ConnectionOptions.originLocalIp stays null.

    Ok(b.finalize())
}

/// Encodes the full registration sequence: the Bootstrap and Call frames
/// back-to-back, ready to be written to the control stream in one send.
pub fn encode_registration(
    auth: &TunnelAuth,
    tunnel_id: &[u8; 16],
    conn_index: u8,
    options: &ConnectionOptions,
) -> Result<Vec<u8>, CodecError> {
    let mut out = encode_bootstrap()?;
    out.extend_from_slice(&encode_register_call(auth, tunnel_id, conn_index, options)?);
    Ok(out)
}

/// Decodes one control-stream message as the registration Call's Return.
///
/// Returns `Ok(None)` when the message is not that Return — a different
/// message kind, or an answer to another question such as the Bootstrap's
/// own Return — so the caller can skip it and keep parsing. Structural
/// errors inside the registration answer itself are reported as `Err`.
pub fn decode_registration_return(msg: &[u8]) -> Result<Option<RegistrationOutcome>, RpcError> {
    let r = Reader::new(msg).map_err(RpcError::Codec)?;

    let Some(root) = r.read_struct_ptr(0)? else {
        return Err(RpcError::MissingField("root"));
    };
    if r.read_u16(root.data_off, 0) != MSG_RETURN {
        return Ok(None);
    }

    let Some(ret) = r.read_struct_ptr(root.ptr_off(0))? else {
        return Err(RpcError::MissingField("Return"));
    };
    if r.read_u32(ret.data_off, 0) != CALL_QUESTION_ID {
        // The Bootstrap's answer (question 0) arrives first; the pipelined
        // Call never consumes it.
        return Ok(None);
    }

    match r.read_u16(ret.data_off, 6) {
        RETURN_EXCEPTION => {
            let mut cause = String::new();
            if let Some(exc) = r.read_struct_ptr(ret.ptr_off(0))? {
                if exc.ptr_count >= 1 {
                    cause = String::from_utf8_lossy(r.read_text(exc.ptr_off(0))?).into_owned();
                }
            }
            Ok(Some(RegistrationOutcome::Refused(RegistrationError {
                cause,
                retry_after_ns: 0,
                should_retry: true,
            })))
        }
        RETURN_CANCELED => Ok(Some(RegistrationOutcome::Refused(RegistrationError {
            cause: "canceled".to_string(),
            retry_after_ns: 0,
            should_retry: false,
        }))),
        RETURN_RESULTS => decode_results(&r, ret.ptr_off(0)).map(Some),
        other => Err(RpcError::UnknownReturnVariant(other)),
    }
}

/// Walks `Payload.content` through the results wrapper struct (0 data words,
/// 1 pointer) down to the ConnectionResponse union.
fn decode_results(r: &Reader<'_>, payload_ptr: usize) -> Result<RegistrationOutcome, RpcError> {
    let payload = r
        .read_struct_ptr(payload_ptr)?
        .ok_or(RpcError::MissingField("Payload"))?;
    let wrapper = r
        .read_struct_ptr(payload.ptr_off(0))?
        .ok_or(RpcError::MissingField("results wrapper"))?;
    if wrapper.ptr_count < 1 {
        return Err(RpcError::MissingField("ConnectionResponse"));
    }
    let response = r
        .read_struct_ptr(wrapper.ptr_off(0))?
        .ok_or(RpcError::MissingField("ConnectionResponse"))?;

    match r.read_u16(response.data_off, 0) {
        RESPONSE_ERROR => {
            let mut error = RegistrationError {
                cause: String::new(),
                retry_after_ns: 0,
                should_retry: false,
            };
            if let Some(err) = r.read_struct_ptr(response.ptr_off(0))? {
                if err.data_words >= 1 {
                    error.retry_after_ns = r.read_u64(err.data_off, 0) as i64;
                }
                if err.data_words >= 2 {
                    // The shouldRetry bit sits at data byte 8 bit 0; absent
                    // data words read as false.
                    error.should_retry = r.read_bool(err.data_off, 8, 0);
                }
                if err.ptr_count >= 1 {
                    error.cause = String::from_utf8_lossy(r.read_text(err.ptr_off(0))?).into_owned();
                }
            } else {
                error.cause = "registration refused without details".to_string();
            }
            Ok(RegistrationOutcome::Refused(error))
        }
        RESPONSE_DETAILS => {
            let details = r
                .read_struct_ptr(response.ptr_off(0))?
                .ok_or(RpcError::MissingField("ConnectionDetails"))?;
            let remotely_managed =
                details.data_words >= 1 && r.read_bool(details.data_off, 0, 0);
            let uuid = if details.ptr_count >= 1 {
                r.read_data(details.ptr_off(0))?.to_vec()
            } else {
                Vec::new()
            };
            let location = if details.ptr_count >= 2 {
                String::from_utf8_lossy(r.read_text(details.ptr_off(1))?).into_owned()
            } else {
                String::new()
            };
            Ok(RegistrationOutcome::Connected(ConnectionDetails {
                uuid,
                location,
                remotely_managed,
            }))
        }
        other => Err(RpcError::UnknownResponseVariant(other)),
    }
}
