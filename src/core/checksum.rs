//! 内容摘要
//!
//! 对象存储的 ETag 是内容的 MD5，本地校验必须使用同一算法。

use md5::{Digest, Md5};
use std::io::Read;
use std::path::Path;

/// 读取文件时的缓冲区大小
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// 计算内存数据的 MD5（小写十六进制）
pub fn md5_hex(data: &[u8]) -> String {
    format!("{:x}", Md5::digest(data))
}

/// 流式计算文件的 MD5，阻塞调用
pub fn md5_file_blocking(path: &Path) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Md5::new();
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];
    loop {
        let n = file.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// 在阻塞线程池中计算文件的 MD5
pub async fn md5_file(path: &Path) -> std::io::Result<String> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || md5_file_blocking(&path))
        .await
        .map_err(std::io::Error::other)?
}

/// 短摘要，用于目录名等标识（BLAKE3 前 16 个十六进制字符）
pub fn short_id(input: &str) -> String {
    let hash = blake3::hash(input.as_bytes());
    hash.to_hex()[..16].to_string()
}
