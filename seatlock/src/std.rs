//! Blocking client
use std::io::{BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpStream};

use seatlock_api::{Booking, Reply};
use tracing::{debug, trace};

use super::{check_name, decode_reply, encode_request, Result};

/// Blocking `seatlockd` client
pub struct Client {
    reader: BufReader<TcpStream>,
    conn: TcpStream,
    line: String,
}

impl Client {
    pub fn connect(server_addr: SocketAddr) -> Result<Self> {
        debug!(?server_addr, "Connecting to seatlockd");
        let conn = TcpStream::connect(server_addr)?;
        trace!(?server_addr, "Connected");

        conn.set_nodelay(true)?;

        Ok(Self {
            reader: BufReader::new(conn.try_clone()?),
            conn,
            line: String::new(),
        })
    }

    /// Send a booking and wait for its reply
    pub fn request(&mut self, booking: &Booking) -> Result<Reply> {
        debug!(%booking, "Sending booking");
        self.conn.write_all(encode_request(booking).as_bytes())?;

        self.line.clear();
        self.reader.read_line(&mut self.line)?;
        let reply = decode_reply(&self.line)?;
        trace!(%reply, "Reply");
        Ok(reply)
    }

    /// Reserve any free seat for `name`
    pub fn reserve(&mut self, name: &str) -> Result<Reply> {
        let name = check_name(name)?;
        self.request(&Booking::Reserve { name })
    }

    /// Reserve a specific seat for `name`
    pub fn book_seat(&mut self, name: &str, seat: u32) -> Result<Reply> {
        let name = check_name(name)?;
        self.request(&Booking::BookSeat { name, seat })
    }

    /// Look up the seat held by `name`
    pub fn search(&mut self, name: &str) -> Result<Reply> {
        let name = check_name(name)?;
        self.request(&Booking::Search { name })
    }

    /// Release the seat held by `name`
    pub fn delete(&mut self, name: &str) -> Result<Reply> {
        let name = check_name(name)?;
        self.request(&Booking::Delete { name })
    }
}
