//! Chunked transfer engine
//!
//! Outgoing buffers are written in `chunk_size` pieces, each one completely
//! before the next. Incoming data is read at most `chunk_size` bytes at a time
//! and accumulated in arrival order until the peer closes the connection.

use std::{
    io::{self, Read, Write},
    num::NonZeroUsize,
};

use bytes::{Bytes, BytesMut};

/// Split `data` into ordered pieces of at most `chunk_size` bytes
///
/// The pieces share `data`'s storage, nothing is copied.
pub(crate) fn chunks(data: &Bytes, chunk_size: NonZeroUsize) -> impl Iterator<Item = Bytes> + '_ {
    let chunk_size = chunk_size.get();
    (0..data.len())
        .step_by(chunk_size)
        .map(move |start| data.slice(start..(start + chunk_size).min(data.len())))
}

/// Write all of `data`, reporting each chunk once it is fully written
pub(crate) fn write_chunked<W, F>(
    mut writer: W,
    data: &Bytes,
    chunk_size: NonZeroUsize,
    mut on_chunk: F,
) -> io::Result<()>
where
    W: Write,
    F: FnMut(Bytes),
{
    for chunk in chunks(data, chunk_size) {
        // write_all loops over short writes and retries on EINTR
        writer.write_all(&chunk)?;
        on_chunk(chunk);
    }
    writer.flush()
}

/// Read until end of stream, reporting each non-empty read
///
/// Returns everything read, in order. Bytes already reported through
/// `on_chunk` are not returned if reading fails part way.
pub(crate) fn read_until_closed<R, F>(
    mut reader: R,
    chunk_size: NonZeroUsize,
    mut on_chunk: F,
) -> io::Result<Bytes>
where
    R: Read,
    F: FnMut(Bytes),
{
    let mut received = BytesMut::new();
    let mut buf = vec![0u8; chunk_size.get()];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => return Ok(received.freeze()),
            Ok(n) => {
                let chunk = Bytes::copy_from_slice(&buf[..n]);
                received.extend_from_slice(&chunk);
                on_chunk(chunk);
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    fn size(n: usize) -> NonZeroUsize {
        NonZeroUsize::new(n).unwrap()
    }

    /// Accepts at most `limit` bytes per write call
    struct ShortWriter {
        written: Vec<u8>,
        limit: usize,
        calls: usize,
    }

    impl Write for ShortWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.calls += 1;
            if self.calls % 3 == 0 {
                return Err(io::Error::new(io::ErrorKind::Interrupted, "signal"));
            }
            let n = buf.len().min(self.limit);
            self.written.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    /// Hands out data in fixed slices, then fails
    struct FailingReader {
        remaining: Vec<&'static [u8]>,
        error: io::ErrorKind,
    }

    impl Read for FailingReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.remaining.is_empty() {
                return Err(self.error.into());
            }
            let next = self.remaining.remove(0);
            buf[..next.len()].copy_from_slice(next);
            Ok(next.len())
        }
    }

    #[test]
    fn test_hello_world_in_fours() {
        let data = Bytes::from_static(b"HELLOWORLD");
        let pieces: Vec<Bytes> = chunks(&data, size(4)).collect();
        assert_eq!(pieces, vec!["HELL", "OWOR", "LD"]);
    }

    #[test]
    fn test_chunk_count_and_total_length() {
        let data = Bytes::from(vec![7u8; 1000]);
        for chunk_size in [1, 3, 7, 64, 999, 1000, 4096] {
            let pieces: Vec<Bytes> = chunks(&data, size(chunk_size)).collect();
            assert_eq!(pieces.len(), data.len().div_ceil(chunk_size));
            assert_eq!(pieces.iter().map(Bytes::len).sum::<usize>(), data.len());
            assert!(pieces.iter().all(|p| !p.is_empty() && p.len() <= chunk_size));
        }
    }

    #[test]
    fn test_empty_buffer_has_no_chunks() {
        assert_eq!(chunks(&Bytes::new(), size(4)).count(), 0);
    }

    #[test]
    fn test_write_survives_short_and_interrupted_writes() {
        let data = Bytes::from_static(b"the quick brown fox jumps over the lazy dog");
        let mut writer = ShortWriter {
            written: Vec::new(),
            limit: 3,
            calls: 0,
        };
        let mut reported = Vec::new();

        write_chunked(&mut writer, &data, size(8), |chunk| reported.push(chunk)).unwrap();

        assert_eq!(writer.written, data);
        assert_eq!(reported.len(), 6);
        assert_eq!(reported.concat(), data);
    }

    #[test]
    fn test_write_zero_is_an_error() {
        let mut buf = [0u8; 4];
        let mut writer = &mut buf[..];
        let data = Bytes::from_static(b"HELLOWORLD");
        let mut reported = Vec::new();

        let err = write_chunked(&mut writer, &data, size(4), |chunk| reported.push(chunk))
            .unwrap_err();

        assert_eq!(err.kind(), io::ErrorKind::WriteZero);
        assert_eq!(reported, vec!["HELL"]);
    }

    #[test]
    fn test_read_accumulates_in_order() {
        let data: Vec<u8> = (0..=255).cycle().take(1500).collect();
        let mut reported = Vec::new();

        let received =
            read_until_closed(Cursor::new(data.clone()), size(512), |chunk| {
                reported.push(chunk)
            })
            .unwrap();

        assert_eq!(received, data);
        assert_eq!(
            reported.iter().map(Bytes::len).collect::<Vec<_>>(),
            vec![512, 512, 476]
        );
        assert_eq!(reported.concat(), data);
    }

    #[test]
    fn test_read_of_closed_stream_is_empty() {
        let received = read_until_closed(Cursor::new(Vec::new()), size(16), |_| {
            panic!("no chunk expected")
        })
        .unwrap();
        assert!(received.is_empty());
    }

    #[test]
    fn test_read_failure_after_progress() {
        let reader = FailingReader {
            remaining: vec![b"abc", b"de"],
            error: io::ErrorKind::WouldBlock,
        };
        let mut reported = Vec::new();

        let err = read_until_closed(reader, size(16), |chunk| reported.push(chunk)).unwrap_err();

        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
        assert_eq!(reported, vec!["abc", "de"]);
    }
}
