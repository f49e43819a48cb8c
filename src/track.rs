// Tracks arrive as rows of chunks, each holding a JSON vector of floats
// normalised to [-1, 1] that encode one byte per element.

use serde::Deserialize;

use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Track {
  pub id: i64,
  pub name: String,
  pub num_chunks: usize,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Chunk {
  pub track_id: i64,
  pub index: u32,
  /// JSON array text, e.g. `"[0.0, -1.0, 1.0]"`.
  pub value: String,
}

/// Undoes the normalisation of one chunk back into bytes.
pub fn chunk_bytes(chunk: &Chunk) -> Result<Vec<u8>> {
  let values: Vec<f64> = serde_json::from_str(&chunk.value)?;
  Ok(
    values
      .into_iter()
      .map(|v| (v * 127.5 + 127.5).round().clamp(0.0, 255.0) as u8)
      .collect(),
  )
}

/// Concatenates chunk bytes in the given order.
pub fn bytes_from_chunks<'a>(chunks: impl IntoIterator<Item = &'a Chunk>) -> Result<Vec<u8>> {
  let mut out = Vec::new();
  for chunk in chunks {
    out.extend(chunk_bytes(chunk)?);
  }
  Ok(out)
}

/// The full byte payload of `track`, or `None` while some of its chunks are
/// still missing.
pub fn assemble_track(track: &Track, chunks: &[Chunk]) -> Result<Option<Vec<u8>>> {
  if track.num_chunks == 0 {
    return Ok(None);
  }
  let mut own: Vec<&Chunk> = chunks.iter().filter(|c| c.track_id == track.id).collect();
  if own.len() != track.num_chunks {
    return Ok(None);
  }
  own.sort_by_key(|c| c.index);
  bytes_from_chunks(own).map(Some)
}

#[cfg(test)]
mod tests {
  use super::*;

  fn chunk(track_id: i64, index: u32, value: &str) -> Chunk {
    Chunk { track_id, index, value: value.to_string() }
  }

  #[test]
  fn denormalises_to_bytes() {
    let c = chunk(1, 0, "[-1.0, 0.0, 1.0, 0.5]");
    // 0.0 -> 127.5 rounds away from zero
    assert_eq!(chunk_bytes(&c).unwrap(), vec![0, 128, 255, 191]);
  }

  #[test]
  fn assembles_in_index_order() {
    let track = Track { id: 7, name: "cello".into(), num_chunks: 2 };
    let chunks = [
      chunk(7, 1, "[1.0]"),
      chunk(3, 0, "[0.0]"),
      chunk(7, 0, "[-1.0]"),
    ];
    assert_eq!(assemble_track(&track, &chunks).unwrap(), Some(vec![0, 255]));
  }

  #[test]
  fn incomplete_or_empty_tracks_are_pending() {
    let track = Track { id: 7, name: "cello".into(), num_chunks: 2 };
    assert_eq!(assemble_track(&track, &[chunk(7, 0, "[0.0]")]).unwrap(), None);
    let empty = Track { num_chunks: 0, ..track };
    assert_eq!(assemble_track(&empty, &[]).unwrap(), None);
  }

  #[test]
  fn bad_json_is_an_error() {
    let track = Track { id: 1, name: "x".into(), num_chunks: 1 };
    assert!(assemble_track(&track, &[chunk(1, 0, "not json")]).is_err());
  }

  #[test]
  fn rows_deserialize() {
    let row: Chunk =
      serde_json::from_str(r#"{"track_id": 4, "index": 2, "value": "[0.25]"}"#).unwrap();
    assert_eq!(row.index, 2);
    assert_eq!(chunk_bytes(&row).unwrap(), vec![159]);
  }
}
