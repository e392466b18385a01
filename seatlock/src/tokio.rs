//! Async client
use std::net::SocketAddr;

use seatlock_api::{Booking, Reply};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::{debug, trace};

use super::{check_name, decode_reply, encode_request, Result};

pub struct Client {
    conn_read: BufReader<OwnedReadHalf>,
    conn_write: OwnedWriteHalf,
    line: String,
}

impl Client {
    pub async fn connect(server_addr: SocketAddr) -> Result<Self> {
        debug!(?server_addr, "Connecting to seatlockd");
        let stream = TcpStream::connect(server_addr).await?;
        trace!(?server_addr, "Connected");

        stream.set_nodelay(true)?;
        let (conn_read, conn_write) = stream.into_split();

        Ok(Self {
            conn_read: BufReader::new(conn_read),
            conn_write,
            line: String::new(),
        })
    }

    pub async fn request(&mut self, booking: &Booking) -> Result<Reply> {
        debug!(%booking, "Sending booking");
        self.conn_write
            .write_all(encode_request(booking).as_bytes())
            .await?;

        self.line.clear();
        self.conn_read.read_line(&mut self.line).await?;
        let reply = decode_reply(&self.line)?;
        trace!(%reply, "Reply");
        Ok(reply)
    }

    pub async fn reserve(&mut self, name: &str) -> Result<Reply> {
        let name = check_name(name)?;
        self.request(&Booking::Reserve { name }).await
    }

    pub async fn book_seat(&mut self, name: &str, seat: u32) -> Result<Reply> {
        let name = check_name(name)?;
        self.request(&Booking::BookSeat { name, seat }).await
    }

    pub async fn search(&mut self, name: &str) -> Result<Reply> {
        let name = check_name(name)?;
        self.request(&Booking::Search { name }).await
    }

    pub async fn delete(&mut self, name: &str) -> Result<Reply> {
        let name = check_name(name)?;
        self.request(&Booking::Delete { name }).await
    }
}
