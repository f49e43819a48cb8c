// Control messages exchanged with the time authority.
//
// Datagram layout (big-endian):
// - 1 byte : magic (fixed to b'C')
// - 1 byte : version (bumped when layout changes)
// - 1 byte : message type
// - N bytes: body, see `SyncMessage`

pub const SYNC_PACKET_MAGIC: u8 = b'C';
// IMPORTANT: Bump SYNC_VERSION whenever the on-wire layout changes.
pub const SYNC_VERSION: u8 = 1;
const HEADER_LEN: usize = 3;

const TYPE_SYNC_REQUEST: u8 = 1;
const TYPE_SYNC_RESPONSE: u8 = 2;
const TYPE_SCHEDULE: u8 = 3;
const TYPE_VOLUME: u8 = 4;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SyncMessage {
  /// Client probe carrying its local send time.
  SyncRequest { t1_ms: i64 },
  /// Authority reply: the echoed client time and the authority's time.
  SyncResponse { t1_ms: i64, s1_ms: i64 },
  /// Absolute target time at which playback should start.
  Schedule { time_ms: i64 },
  /// Output gain, 0.0..=1.0.
  Volume { level: f32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncDecodeError {
  TooShort,
  BadMagic,
  BadVersion,
  UnknownType,
}

impl core::fmt::Display for SyncDecodeError {
  fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
    match self {
      SyncDecodeError::TooShort => write!(f, "sync packet too short"),
      SyncDecodeError::BadMagic => write!(f, "bad sync packet magic"),
      SyncDecodeError::BadVersion => {
        write!(f, "unsupported sync packet version")
      }
      SyncDecodeError::UnknownType => write!(f, "unknown sync packet type"),
    }
  }
}

impl std::error::Error for SyncDecodeError {}

pub fn encode_sync(msg: &SyncMessage) -> Vec<u8> {
  let mut v = Vec::with_capacity(HEADER_LEN + 16);
  v.push(SYNC_PACKET_MAGIC);
  v.push(SYNC_VERSION);
  match *msg {
    SyncMessage::SyncRequest { t1_ms } => {
      v.push(TYPE_SYNC_REQUEST);
      v.extend_from_slice(&t1_ms.to_be_bytes());
    }
    SyncMessage::SyncResponse { t1_ms, s1_ms } => {
      v.push(TYPE_SYNC_RESPONSE);
      v.extend_from_slice(&t1_ms.to_be_bytes());
      v.extend_from_slice(&s1_ms.to_be_bytes());
    }
    SyncMessage::Schedule { time_ms } => {
      v.push(TYPE_SCHEDULE);
      v.extend_from_slice(&time_ms.to_be_bytes());
    }
    SyncMessage::Volume { level } => {
      v.push(TYPE_VOLUME);
      v.extend_from_slice(&level.to_be_bytes());
    }
  }
  v
}

pub fn decode_sync(data: &[u8]) -> Result<SyncMessage, SyncDecodeError> {
  if data.is_empty() {
    return Err(SyncDecodeError::TooShort);
  }
  if data[0] != SYNC_PACKET_MAGIC {
    return Err(SyncDecodeError::BadMagic);
  }
  if data.len() < 2 {
    return Err(SyncDecodeError::TooShort);
  }
  if data[1] != SYNC_VERSION {
    return Err(SyncDecodeError::BadVersion);
  }
  if data.len() < HEADER_LEN {
    return Err(SyncDecodeError::TooShort);
  }
  let body = &data[HEADER_LEN..];
  match data[2] {
    TYPE_SYNC_REQUEST => Ok(SyncMessage::SyncRequest {
      t1_ms: read_i64(body, 0)?,
    }),
    TYPE_SYNC_RESPONSE => Ok(SyncMessage::SyncResponse {
      t1_ms: read_i64(body, 0)?,
      s1_ms: read_i64(body, 8)?,
    }),
    TYPE_SCHEDULE => Ok(SyncMessage::Schedule {
      time_ms: read_i64(body, 0)?,
    }),
    TYPE_VOLUME => {
      let b: [u8; 4] = body
        .get(..4)
        .and_then(|s| s.try_into().ok())
        .ok_or(SyncDecodeError::TooShort)?;
      Ok(SyncMessage::Volume { level: f32::from_be_bytes(b) })
    }
    _ => Err(SyncDecodeError::UnknownType),
  }
}

fn read_i64(body: &[u8], at: usize) -> Result<i64, SyncDecodeError> {
  let b: [u8; 8] = body
    .get(at..at + 8)
    .and_then(|s| s.try_into().ok())
    .ok_or(SyncDecodeError::TooShort)?;
  Ok(i64::from_be_bytes(b))
}
