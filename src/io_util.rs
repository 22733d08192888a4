/// 非阻塞 I/O 辅助模块
///
/// 提供一次读取得到的数据块，以及尽量写出数据块的非阻塞写入函数
use std::io::{self, Write};

/// 一次读取得到的数据块，记录尚未写出的区间
///
/// # 示例
/// ```rust
/// use tcproxy::io_util::Chunk;
///
/// let mut chunk = Chunk::new(b"Hello, World!".to_vec(), 5);
/// assert_eq!(chunk.remaining(), b"Hello");
/// chunk.advance(2);
/// assert_eq!(chunk.remaining(), b"llo");
/// ```
#[derive(Debug)]
pub struct Chunk {
    buf: Vec<u8>,
    start: usize,
    end: usize,
}

impl Chunk {
    /// 用缓冲区的前 `filled` 字节创建数据块
    pub fn new(buf: Vec<u8>, filled: usize) -> Self {
        let end = filled.min(buf.len());
        Self { buf, start: 0, end }
    }

    /// 尚未写出的数据
    pub fn remaining(&self) -> &[u8] {
        &self.buf[self.start..self.end]
    }

    /// 标记 n 个字节已写出
    pub fn advance(&mut self, n: usize) {
        self.start = (self.start + n).min(self.end);
    }

    /// 尚未写出的字节数
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    /// 是否已全部写出
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// 取回底层缓冲区（用于归还缓冲区池）
    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}

/// 尽可能多地写出数据块，直到写完或对端暂时无法接收
///
/// 返回本次写出的字节数；写入返回 0 视为连接已关闭。
pub fn write_chunk<W: Write>(writer: &mut W, chunk: &mut Chunk) -> io::Result<usize> {
    let mut written = 0;

    while !chunk.is_empty() {
        match writer.write(chunk.remaining()) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "failed to write relayed data",
                ))
            }
            Ok(n) => {
                chunk.advance(n);
                written += n;
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }

    Ok(written)
}
