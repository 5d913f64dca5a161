//! Line-oriented wire format of the messaging protocol: a header line of
//! `KEY:VALUE` fields separated by `;`, optionally followed by one verbatim
//! body line. Recognized keys are `OPERACION`, `IP`, `PUERTO`, `USER` and
//! `ADDRESS`; the codec itself is key-agnostic.

/// Header field keys.
pub(crate) const KEY_OPERATION: &str = "OPERACION";
pub(crate) const KEY_IP: &str = "IP";
pub(crate) const KEY_PORT: &str = "PUERTO";
pub(crate) const KEY_ADDRESS: &str = "ADDRESS";

/// Literal ACK line of the backend request protocol.
pub(crate) const ACK: &str = "ACK";

/// Reply to a successful backend registration.
pub(crate) const REGISTER_ACK: &str = "RESPUESTA:ACK";

/// Header line preceding a client request's reply.
pub(crate) const RESPONSE_HEADER: &str = "OPERACION:RESPUESTA";

/// Header line preceding a server-originated message pushed to a client.
pub(crate) const GET_MESSAGE_HEADER: &str = "OPERACION:GET_MESSAGE";

/// Error tokens surfaced to clients on the response line.
pub(crate) const ERR_NO_BACKENDS: &str =
    "ERROR;MSG:No hay backends disponibles";
pub(crate) const ERR_ALL_BACKENDS_DOWN: &str =
    "ERROR;MSG:Todos los backends caidos";
pub(crate) const ERR_UNKNOWN_OP: &str = "ERROR;MSG:Operacion desconocida";
pub(crate) const RESEND_ERROR: &str = "OPERACION:RESEND_ERROR";

/// Tagged classification of a header line's `OPERACION` field. Total:
/// anything unrecognized maps to `Unknown`.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub(crate) enum Operation {
    /// Backend replica self-registration; one-shot.
    Register,

    /// Client request to be forwarded, reply wrapped in `RESPUESTA`.
    ClientReq,

    /// Generic message forwarded as-is.
    Message,

    /// Server-originated push targeting a connected client.
    SendMessage,

    /// Client-gone notification; normally synthesized internally.
    Disconnect,

    /// Anything else.
    Unknown,
}

impl Operation {
    /// Classifies a header line by its `OPERACION` field.
    pub(crate) fn classify(header: &str) -> Operation {
        match parse_field(header, KEY_OPERATION) {
            "REGISTER" => Operation::Register,
            "CLIENT_REQ" => Operation::ClientReq,
            "MESSAGE" => Operation::Message,
            "SEND_MESSAGE" => Operation::SendMessage,
            "DISCONNECT" => Operation::Disconnect,
            _ => Operation::Unknown,
        }
    }
}

/// Extracts the value of `key` from a header line. First occurrence wins;
/// whitespace around keys and values is trimmed; a missing key yields the
/// empty string. Never fails.
pub(crate) fn parse_field<'h>(header: &'h str, key: &str) -> &'h str {
    for field in header.split(';') {
        if let Some((k, v)) = field.split_once(':') {
            if k.trim() == key {
                return v.trim();
            }
        }
    }
    ""
}

/// Symmetric header encoder: `KEY:VALUE` fields joined by `;`.
pub(crate) fn encode_header(fields: &[(&str, &str)]) -> String {
    fields
        .iter()
        .map(|(k, v)| format!("{}:{}", k, v))
        .collect::<Vec<_>>()
        .join(";")
}
