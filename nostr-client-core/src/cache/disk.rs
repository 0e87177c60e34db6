//! Disk tier for `EventCache` (§6 "Disk layout"): one JSON file per
//! event, named `<event_id>.json`, under the configured directory. File
//! mtime drives TTL cleanup; size accounting iterates directory entries.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use nostr_proto::Event;

use crate::error::CacheError;

fn event_path(dir: &Path, id: &str) -> PathBuf {
  dir.join(format!("{id}.json"))
}

pub async fn write_event(dir: &Path, event: &Event) -> crate::Result<()> {
  tokio::fs::create_dir_all(dir).await.map_err(CacheError::Disk)?;
  let path = event_path(dir, &event.id);
  tokio::fs::write(path, event.as_json()).await.map_err(CacheError::Disk)?;
  Ok(())
}

pub async fn read_event(dir: &Path, id: &str) -> crate::Result<Option<Event>> {
  let path = event_path(dir, id);
  match tokio::fs::read_to_string(&path).await {
    Ok(raw) => {
      let event = Event::from_json(&raw)
        .map_err(|e| CacheError::InvalidContent(format!("corrupt cache file {}: {e}", path.display())))?;
      Ok(Some(event))
    }
    Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
    Err(e) => Err(CacheError::Disk(e).into()),
  }
}

pub async fn remove_event(dir: &Path, id: &str) -> crate::Result<()> {
  let path = event_path(dir, id);
  match tokio::fs::remove_file(path).await {
    Ok(()) => Ok(()),
    Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
    Err(e) => Err(CacheError::Disk(e).into()),
  }
}

/// Deletes files older than `max_age`, then, if the directory still
/// exceeds `max_size_bytes`, removes oldest-first until under the limit.
pub async fn cleanup(dir: &Path, max_age: Duration, max_size_bytes: u64) -> crate::Result<()> {
  let mut read_dir = match tokio::fs::read_dir(dir).await {
    Ok(read_dir) => read_dir,
    Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
    Err(e) => return Err(CacheError::Disk(e).into()),
  };

  let now = SystemTime::now();
  let mut survivors: Vec<(PathBuf, SystemTime, u64)> = Vec::new();

  while let Some(entry) = read_dir.next_entry().await.map_err(CacheError::Disk)? {
    let path = entry.path();
    if path.extension().and_then(|e| e.to_str()) != Some("json") {
      continue;
    }
    let metadata = entry.metadata().await.map_err(CacheError::Disk)?;
    let modified = metadata.modified().unwrap_or(now);
    let age = now.duration_since(modified).unwrap_or_default();
    if age > max_age {
      let _ = tokio::fs::remove_file(&path).await;
      continue;
    }
    survivors.push((path, modified, metadata.len()));
  }

  let mut total_size: u64 = survivors.iter().map(|(_, _, size)| size).sum();
  if total_size <= max_size_bytes {
    return Ok(());
  }

  survivors.sort_by_key(|(_, modified, _)| *modified);
  for (path, _, size) in survivors {
    if total_size <= max_size_bytes {
      break;
    }
    if tokio::fs::remove_file(&path).await.is_ok() {
      total_size = total_size.saturating_sub(size);
    }
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  #[cfg(test)]
  use pretty_assertions::assert_eq;

  fn sample_event(id: &str, content: &str) -> Event {
    Event {
      id: id.to_string(),
      pubkey: "pk".to_string(),
      created_at: 1,
      kind: nostr_proto::EventKind::Text,
      tags: vec![],
      content: content.to_string(),
      sig: "sig".to_string(),
    }
  }

  #[tokio::test]
  async fn write_then_read_round_trips() {
    let dir = tempdir();
    let event = sample_event("abc", "hello");
    write_event(dir.path(), &event).await.unwrap();
    let back = read_event(dir.path(), "abc").await.unwrap().unwrap();
    assert_eq!(back, event);
  }

  #[tokio::test]
  async fn missing_event_reads_as_none() {
    let dir = tempdir();
    assert!(read_event(dir.path(), "missing").await.unwrap().is_none());
  }

  #[tokio::test]
  async fn remove_deletes_the_backing_file() {
    let dir = tempdir();
    let event = sample_event("def", "bye");
    write_event(dir.path(), &event).await.unwrap();
    remove_event(dir.path(), "def").await.unwrap();
    assert!(read_event(dir.path(), "def").await.unwrap().is_none());
  }

  struct TempDir(PathBuf);
  impl TempDir {
    fn path(&self) -> &Path {
      &self.0
    }
  }
  impl Drop for TempDir {
    fn drop(&mut self) {
      let _ = std::fs::remove_dir_all(&self.0);
    }
  }

  fn tempdir() -> TempDir {
    let dir = std::env::temp_dir().join(format!("nostr-client-core-cache-test-{}", uuid::Uuid::new_v4()));
    TempDir(dir)
  }
}
