//! Wire protocol utilities
//!
//! Async frame IO over any tokio stream.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::trace;

use super::frame::{Frame, FrameReader, FrameWriter, HEADER_SIZE, MAC_SIZE};
use crate::error::P2pError;

/// Read one frame; a short read surfaces as `FrameError::ShortRead`
pub async fn read_frame<R: AsyncReadExt + Unpin>(codec: &mut FrameReader, reader: &mut R) -> Result<Frame, P2pError> {
    let mut header = [0u8; HEADER_SIZE];
    reader.read_exact(&mut header).await?;
    let header = codec.open_header(&header)?;

    let mut body = vec![0u8; header.padded_len() + MAC_SIZE];
    reader.read_exact(&mut body).await?;
    let frame = codec.open_body(&header, &body)?;
    trace!("Read frame {:016x} ({} bytes)", frame.id, frame.data.len());
    Ok(frame)
}

/// Write one frame and flush
pub async fn write_frame<W: AsyncWriteExt + Unpin>(
    codec: &mut FrameWriter,
    writer: &mut W,
    flags: [u8; 4],
    id: u64,
    data: &[u8],
) -> Result<(), P2pError> {
    let sealed = codec.seal(flags, id, data)?;
    writer.write_all(&sealed).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FrameErrorKind;
    use crate::protocol::frame::{FrameCodec, Secrets};

    const KEY: &str = "6368616e676520746869732070617373776f726420746f206120736563726574";

    fn codec() -> FrameCodec {
        let key = hex::decode(KEY).unwrap();
        FrameCodec::new(Secrets::new(key.clone(), key, false)).unwrap()
    }

    #[tokio::test]
    async fn test_frame_stream_interop() {
        let sizes = [
            3usize, 113, 281, 1229, 1723, 16, 31, 63, 128, 255, 1020, 2021, 4096, 8011, 16394, 32788, 65535, 23434,
            512, 4096,
        ];
        let frames: Vec<Frame> = sizes
            .iter()
            .map(|size| {
                let data: Vec<u8> = (0..*size).map(|_| rand::random::<u8>()).collect();
                Frame::new(rand::random(), rand::random(), data)
            })
            .collect();

        let (mut client, mut server) = tokio::io::duplex(1 << 20);
        let (_, mut writer) = codec().split();
        let (mut reader, _) = codec().split();

        let expected = frames.clone();
        let write_task = tokio::spawn(async move {
            for frame in &frames {
                write_frame(&mut writer, &mut client, frame.flags, frame.id, &frame.data).await.unwrap();
            }
        });

        for want in expected {
            let got = read_frame(&mut reader, &mut server).await.unwrap();
            assert_eq!(got, want);
        }
        write_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_eof_is_short_read() {
        let (client, mut server) = tokio::io::duplex(64);
        drop(client);
        let (mut reader, _) = codec().split();
        let err = read_frame(&mut reader, &mut server).await.unwrap_err();
        assert_eq!(err.frame_kind(), Some(FrameErrorKind::ShortRead));
    }
}
