//! FTP 数据源
//!
//! 每个操作使用独立的控制连接（登录 → 执行 → QUIT），数据通道
//! 一律走被动模式。并发由上层的信号量预算控制，这里不做连接复用。

use super::{ByteStream, RemoteSource, IO_TIMEOUT_SECS, OP_TIMEOUT_SECS};
use crate::error::SyncError;
use crate::repository::Repository;
use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use regex::Regex;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::io::ReaderStream;
use tracing::{debug, trace};

/// 下载数据流的读取缓冲大小
const DOWNLOAD_BUFFER_SIZE: usize = 64 * 1024;

fn op_timeout() -> Duration {
    Duration::from_secs(OP_TIMEOUT_SECS)
}

fn io_timeout() -> Duration {
    Duration::from_secs(IO_TIMEOUT_SECS)
}

/// 列表命令的尝试顺序
const LISTING_COMMANDS: [&str; 3] = ["MLSD", "LIST -al", "NLST"];

/// 一条 FTP 响应
#[derive(Debug)]
struct Reply {
    code: u16,
    text: String,
}

impl Reply {
    fn is_preliminary(&self) -> bool {
        (100..200).contains(&self.code)
    }
}

/// 单次操作的控制连接
struct FtpConnection {
    stream: BufReader<TcpStream>,
}

impl FtpConnection {
    /// 读取一条响应，处理 "NNN-" 开头的多行形式
    async fn read_reply(&mut self) -> Result<Reply, SyncError> {
        let mut line = String::new();
        let n = timeout(op_timeout(), self.stream.read_line(&mut line))
            .await
            .map_err(|_| SyncError::Protocol("等待响应超时".to_string()))??;
        if n == 0 {
            return Err(SyncError::Protocol("连接被服务器关闭".to_string()));
        }

        let trimmed = line.trim_end();
        if trimmed.len() < 3 {
            return Err(SyncError::Protocol(format!("无法解析的响应: {}", trimmed)));
        }
        let code: u16 = trimmed[..3]
            .parse()
            .map_err(|_| SyncError::Protocol(format!("无法解析的响应: {}", trimmed)))?;
        let mut text = trimmed[3..].trim_start().to_string();

        if trimmed.as_bytes().get(3) == Some(&b'-') {
            // 多行响应，读到 "NNN " 结束行为止
            let terminator = format!("{} ", &trimmed[..3]);
            loop {
                let mut next = String::new();
                let n = timeout(op_timeout(), self.stream.read_line(&mut next))
                    .await
                    .map_err(|_| SyncError::Protocol("等待响应超时".to_string()))??;
                if n == 0 {
                    return Err(SyncError::Protocol("连接被服务器关闭".to_string()));
                }
                if next.starts_with(&terminator) {
                    text = next[4..].trim_end().to_string();
                    break;
                }
            }
        }

        trace!("FTP <<< {} {}", code, text);
        Ok(Reply { code, text })
    }

    /// 发送一条命令并读取响应
    async fn command(&mut self, cmd: &str) -> Result<Reply, SyncError> {
        if cmd.starts_with("PASS ") {
            trace!("FTP >>> PASS ****");
        } else {
            trace!("FTP >>> {}", cmd);
        }
        self.stream.write_all(cmd.as_bytes()).await?;
        self.stream.write_all(b"\r\n").await?;
        self.stream.flush().await?;
        self.read_reply().await
    }

    /// 进入被动模式并建立数据连接
    async fn open_data(&mut self) -> Result<TcpStream, SyncError> {
        let reply = self.command("PASV").await?;
        if reply.code != 227 {
            return Err(SyncError::Protocol(format!(
                "PASV 被拒绝: {} {}",
                reply.code, reply.text
            )));
        }
        let addr = parse_pasv_reply(&reply.text)?;
        let stream = timeout(op_timeout(), TcpStream::connect(addr))
            .await
            .map_err(|_| SyncError::Protocol(format!("数据连接 {} 超时", addr)))?
            .map_err(|e| SyncError::Protocol(format!("数据连接失败: {}", e)))?;
        Ok(stream)
    }

    /// 发起一次数据传输命令，返回已就绪的数据连接
    async fn start_transfer(&mut self, cmd: &str) -> Result<TcpStream, SyncError> {
        let data = self.open_data().await?;
        let reply = self.command(cmd).await?;
        if !reply.is_preliminary() {
            return Err(SyncError::Protocol(format!(
                "{} 失败: {} {}",
                cmd, reply.code, reply.text
            )));
        }
        Ok(data)
    }

    /// 数据通道读完后消费最终响应（226），失败不影响已取得的数据
    async fn finish_transfer(&mut self) {
        let _ = self.read_reply().await;
    }

    async fn quit(mut self) {
        let _ = timeout(Duration::from_secs(5), self.command("QUIT")).await;
    }
}

/// FTP 远程数据源
pub struct FtpSource {
    host: String,
    port: u16,
    username: String,
    password: String,
    connect_timeout: Duration,
    name: String,
}

impl FtpSource {
    pub fn new(repository: &Repository) -> Self {
        Self::with_timeout(repository, Duration::from_secs(10))
    }

    pub fn with_timeout(repository: &Repository, connect_timeout: Duration) -> Self {
        Self {
            host: repository.host.clone(),
            port: repository.port,
            username: repository.username.clone(),
            password: repository.password.clone(),
            connect_timeout,
            name: format!("ftp://{}:{}", repository.host, repository.port),
        }
    }

    /// 建立控制连接并登录
    async fn connect(&self) -> Result<FtpConnection, SyncError> {
        let stream = timeout(
            self.connect_timeout,
            TcpStream::connect((self.host.as_str(), self.port)),
        )
        .await
        .map_err(|_| SyncError::Protocol(format!("连接 {}:{} 超时", self.host, self.port)))?
        .map_err(|e| SyncError::Protocol(format!("连接 {}:{} 失败: {}", self.host, self.port, e)))?;

        let mut conn = FtpConnection {
            stream: BufReader::new(stream),
        };

        let greeting = conn.read_reply().await?;
        if greeting.code != 220 {
            return Err(SyncError::Protocol(format!(
                "服务器问候异常: {} {}",
                greeting.code, greeting.text
            )));
        }

        let user = conn.command(&format!("USER {}", self.username)).await?;
        match user.code {
            230 => {}
            331 | 332 => {
                let pass = conn.command(&format!("PASS {}", self.password)).await?;
                if pass.code != 230 {
                    return Err(SyncError::Protocol(format!(
                        "登录被拒绝: {} {}",
                        pass.code, pass.text
                    )));
                }
            }
            _ => {
                return Err(SyncError::Protocol(format!(
                    "USER 被拒绝: {} {}",
                    user.code, user.text
                )));
            }
        }

        // 二进制传输模式；个别服务器不认也不致命
        let mode = conn.command("TYPE I").await?;
        if mode.code != 200 {
            debug!("TYPE I 未被接受: {} {}", mode.code, mode.text);
        }

        Ok(conn)
    }

    /// 用指定命令取一次目录列表
    async fn list_once(&self, cmd: &str, escaped_path: &str) -> Result<String, SyncError> {
        let mut conn = self.connect().await?;
        let mut data = conn
            .start_transfer(&format!("{} {}", cmd, escaped_path))
            .await?;

        let mut buf = Vec::new();
        timeout(io_timeout(), data.read_to_end(&mut buf))
            .await
            .map_err(|_| SyncError::Protocol("读取目录列表超时".to_string()))??;
        drop(data);

        conn.finish_transfer().await;
        conn.quit().await;

        Ok(String::from_utf8_lossy(&buf).into_owned())
    }
}

#[async_trait]
impl RemoteSource for FtpSource {
    async fn check(&self) -> Result<(), SyncError> {
        match self.connect().await {
            Ok(conn) => {
                conn.quit().await;
                Ok(())
            }
            Err(e) => Err(SyncError::Connectivity(e.to_string())),
        }
    }

    async fn read_listing(&self, path: &str) -> Result<String, SyncError> {
        let escaped = escape_path(path);
        let mut last_error = None;

        // 列表命令逐个回退；都失败时以最后一个错误为准
        for cmd in LISTING_COMMANDS {
            match self.list_once(cmd, &escaped).await {
                Ok(text) => return Ok(text),
                Err(e) => {
                    debug!("{} {} 失败: {}", cmd, path, e);
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| SyncError::Protocol("目录列表不可用".to_string())))
    }

    async fn probe_size(&self, path: &str) -> Result<u64, SyncError> {
        let mut conn = self.connect().await?;
        let reply = conn.command(&format!("SIZE {}", escape_path(path))).await?;
        conn.quit().await;

        if reply.code != 213 {
            return Err(SyncError::Protocol(format!(
                "SIZE 被拒绝: {} {}",
                reply.code, reply.text
            )));
        }
        reply
            .text
            .trim()
            .parse()
            .map_err(|_| SyncError::Protocol(format!("SIZE 响应无法解析: {}", reply.text)))
    }

    async fn fetch(&self, path: &str) -> Result<ByteStream, SyncError> {
        let mut conn = self.connect().await?;
        let data = conn
            .start_transfer(&format!("RETR {}", escape_path(path)))
            .await?;

        Ok(Box::pin(FtpByteStream {
            data: ReaderStream::with_capacity(data, DOWNLOAD_BUFFER_SIZE),
            _control: conn,
        }))
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// RETR 数据流；控制连接要陪伴数据通道读完，否则部分服务器会中止传输
struct FtpByteStream {
    data: ReaderStream<TcpStream>,
    _control: FtpConnection,
}

impl Stream for FtpByteStream {
    type Item = std::io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.data).poll_next(cx)
    }
}

/// 解析 "227 Entering Passive Mode (h1,h2,h3,h4,p1,p2)"
fn parse_pasv_reply(text: &str) -> Result<SocketAddr, SyncError> {
    let re = Regex::new(r"(\d{1,3}),(\d{1,3}),(\d{1,3}),(\d{1,3}),(\d{1,3}),(\d{1,3})")
        .map_err(|e| SyncError::Protocol(e.to_string()))?;
    let caps = re
        .captures(text)
        .ok_or_else(|| SyncError::Protocol(format!("PASV 响应无法解析: {}", text)))?;

    let octet = |i: usize| -> Result<u8, SyncError> {
        caps[i]
            .parse()
            .map_err(|_| SyncError::Protocol(format!("PASV 响应无法解析: {}", text)))
    };

    let ip = IpAddr::V4(Ipv4Addr::new(octet(1)?, octet(2)?, octet(3)?, octet(4)?));
    let port = u16::from(octet(5)?) * 256 + u16::from(octet(6)?);
    Ok(SocketAddr::new(ip, port))
}

/// 构造协议地址时转义有特殊意义的字符（@ 在模组目录名里很常见），
/// 快照内部的路径字符串保持未转义
pub(crate) fn escape_path(path: &str) -> String {
    urlencoding::encode(path).replace("%2F", "/")
}
