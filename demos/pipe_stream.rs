//! Streams bytes written into a pipe through a `SocketSource`.
//!
//! A background thread plays the role of the peer, writing a few lines into
//! the pipe and then closing its end; the main thread drives the event loop
//! until the stream reports close.

use std::io;
use std::os::fd::AsRawFd;
use std::time::Duration;

use bytes::Bytes;
use miniloop::{set_nonblocking, Ack, Downstream, EventLoop, FdSocket, SocketSource};

struct Printer;

impl Downstream for Printer {
    fn next_chunk(&mut self, chunk: Bytes, ack: Ack) {
        print!("{}", String::from_utf8_lossy(&chunk));
        ack.ready();
    }

    fn error(&mut self, error: io::Error) {
        eprintln!("read error: {}", error);
    }

    fn close(&mut self) {
        println!("-- stream closed --");
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let (rx, tx) = nix::unistd::pipe()?;
    set_nonblocking(rx.as_raw_fd())?;

    let event_loop = EventLoop::new("demo")?;
    let source = SocketSource::new(&event_loop, Box::new(FdSocket::new(rx)))?;
    source.attach(Box::new(Printer));

    let writer = std::thread::spawn(move || {
        for line in ["one\n", "two\n", "three\n"] {
            nix::unistd::write(&tx, line.as_bytes()).expect("write to pipe");
            std::thread::sleep(Duration::from_millis(200));
        }
        // Dropping the write end hangs the read end up, which ends the stream.
    });

    while !source.is_closed() {
        event_loop.run();
    }
    writer.join().expect("writer thread");
    Ok(())
}
