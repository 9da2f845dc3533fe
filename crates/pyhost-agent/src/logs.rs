use std::{io::ErrorKind, path::Path};

use tokio::io::{AsyncReadExt, AsyncSeekExt};

/// Bytes shown for a crashed target.
pub const CRASH_TAIL_BYTES: u64 = 2000;

/// Reads at most the final `max_bytes` of a log file. A missing file is `Ok(None)`.
pub async fn tail_bytes(path: &Path, max_bytes: u64) -> std::io::Result<Option<Vec<u8>>> {
    let mut f = match tokio::fs::File::open(path).await {
        Ok(f) => f,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };

    let size = f.metadata().await?.len();
    let start = size.saturating_sub(max_bytes);
    f.seek(std::io::SeekFrom::Start(start)).await?;

    let mut buf = Vec::with_capacity((size - start) as usize);
    f.take(max_bytes).read_to_end(&mut buf).await?;
    Ok(Some(buf))
}

/// Lossy text rendering of a log tail. A cut multi-byte character at the front is dropped.
pub fn tail_text(buf: &[u8]) -> String {
    let skip = buf
        .iter()
        .take(3)
        .take_while(|b| (**b & 0b1100_0000) == 0b1000_0000)
        .count();
    String::from_utf8_lossy(&buf[skip..]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn tail_is_capped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.log");
        let body: String = (0..5000).map(|i| char::from(b'a' + (i % 26) as u8)).collect();
        tokio::fs::write(&path, &body).await.unwrap();

        let tail = tail_bytes(&path, CRASH_TAIL_BYTES).await.unwrap().unwrap();
        assert_eq!(tail.len(), 2000);
        assert_eq!(tail, body.as_bytes()[3000..]);
    }

    #[tokio::test]
    async fn short_file_is_returned_whole() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.log");
        tokio::fs::write(&path, "boom\n").await.unwrap();
        let tail = tail_bytes(&path, 2000).await.unwrap().unwrap();
        assert_eq!(tail_text(&tail), "boom\n");
    }

    #[tokio::test]
    async fn missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(tail_bytes(&dir.path().join("nope.log"), 10)
            .await
            .unwrap()
            .is_none());
    }

    #[test]
    fn leading_continuation_bytes_are_dropped() {
        let s = "é!".as_bytes();
        assert_eq!(tail_text(&s[1..]), "!");
    }
}
