//! 定长帧头的编解码与异步读写

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{FrameKind, NetworkError, COMMAND_LENGTH, HEADER_LENGTH};

/// 一个完整的帧
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub body: Bytes,
}

impl Frame {
    pub fn new(kind: FrameKind, body: impl Into<Bytes>) -> Self {
        Self {
            kind,
            body: body.into(),
        }
    }

    /// 不带负载的控制帧或命令帧
    pub fn empty(kind: FrameKind) -> Self {
        Self::new(kind, Bytes::new())
    }

    /// 编码为 命令字段 + 长度字段 + 负载
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LENGTH + self.body.len());
        put_field(&mut buf, self.kind.as_str_name());
        put_field(&mut buf, &self.body.len().to_string());
        buf.put_slice(&self.body);
        buf.freeze()
    }

    /// 解析帧头，返回帧类型和负载长度
    pub fn parse_header(
        header: &[u8],
        max_len: usize,
    ) -> Result<(FrameKind, usize), NetworkError> {
        if header.len() < HEADER_LENGTH {
            return Err(NetworkError::ProtocolViolation(format!(
                "short header ({} bytes)",
                header.len()
            )));
        }
        let name = read_field(&header[..COMMAND_LENGTH])?;
        let kind = FrameKind::from_str_name(name)
            .ok_or_else(|| NetworkError::ProtocolViolation(format!("unknown command {:?}", name)))?;
        let len_text = read_field(&header[COMMAND_LENGTH..HEADER_LENGTH])?;
        let len: usize = len_text.parse().map_err(|_| {
            NetworkError::ProtocolViolation(format!("invalid length field {:?}", len_text))
        })?;
        if len > max_len {
            return Err(NetworkError::FrameTooLarge { len, max: max_len });
        }
        Ok((kind, len))
    }

    /// 从内存中解码一个完整帧，返回帧和消耗的字节数
    pub fn decode(buf: &[u8], max_len: usize) -> Result<(Frame, usize), NetworkError> {
        let (kind, len) = Self::parse_header(buf, max_len)?;
        let total = HEADER_LENGTH + len;
        if buf.len() < total {
            return Err(NetworkError::ProtocolViolation(format!(
                "truncated frame ({} of {} bytes)",
                buf.len(),
                total
            )));
        }
        let body = Bytes::copy_from_slice(&buf[HEADER_LENGTH..total]);
        Ok((Frame { kind, body }, total))
    }
}

fn put_field(buf: &mut BytesMut, value: &str) {
    let bytes = value.as_bytes();
    let n = bytes.len().min(COMMAND_LENGTH);
    buf.put_slice(&bytes[..n]);
    buf.put_bytes(b' ', COMMAND_LENGTH - n);
}

fn read_field(field: &[u8]) -> Result<&str, NetworkError> {
    std::str::from_utf8(field)
        .map(|s| s.trim_matches(|c: char| c == ' ' || c == '\0'))
        .map_err(|_| NetworkError::ProtocolViolation("header field is not ASCII".into()))
}

/// 读取一个帧；对端在帧边界正常关闭时返回`None`
pub async fn read_frame<R>(reader: &mut R, max_len: usize) -> Result<Option<Frame>, NetworkError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LENGTH];
    let first = reader.read(&mut header).await?;
    if first == 0 {
        return Ok(None);
    }
    reader.read_exact(&mut header[first..]).await?;

    let (kind, len) = Frame::parse_header(&header, max_len)?;
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Some(Frame::new(kind, body)))
}

/// 写出一个帧并flush
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<(), NetworkError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&frame.encode()).await?;
    writer.flush().await?;
    Ok(())
}
