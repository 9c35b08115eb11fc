//! Control-socket client plumbing.
//!
//! The wire protocol is deliberately plain: one newline-terminated request
//! line per connection, a text response, then EOF. Responses that report a
//! failure lead with a line containing only `error`.

use std::io::{Read as _, Write as _};
use std::os::unix::net::UnixStream;
use std::path::Path;

/// Send one request line and collect the full response.
pub fn client_call(sock: &Path, request: &str) -> anyhow::Result<String> {
    let mut stream = UnixStream::connect(sock).map_err(|e| {
        anyhow::anyhow!(
            "failed to connect to govmaster socket {}: {e}",
            sock.display()
        )
    })?;

    let line = format!("{}\n", request.trim_end());
    stream.write_all(line.as_bytes())?;
    stream.flush()?;

    let mut response = String::new();
    stream.read_to_string(&mut response)?;
    if response.is_empty() {
        anyhow::bail!("empty response from daemon");
    }

    if let Some(rest) = response.strip_prefix("error\n") {
        anyhow::bail!("{}", rest.trim_end());
    }
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead as _, BufReader};
    use std::os::unix::net::UnixListener;

    #[test]
    fn round_trips_one_request() {
        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("test.sock");
        let listener = UnixListener::bind(&sock).unwrap();

        let server = std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream);
            let mut line = String::new();
            reader.read_line(&mut line).unwrap();
            assert_eq!(line, "ping\n");
            let mut stream = reader.into_inner();
            stream.write_all(b"pong\n").unwrap();
        });

        let resp = client_call(&sock, "ping").unwrap();
        assert_eq!(resp, "pong\n");
        server.join().unwrap();
    }

    #[test]
    fn error_responses_become_errors() {
        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("test.sock");
        let listener = UnixListener::bind(&sock).unwrap();

        let server = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 256];
            let _ = std::io::Read::read(&mut stream, &mut buf).unwrap();
            stream.write_all(b"error\nunknown_command\n").unwrap();
        });

        let err = client_call(&sock, "bogus").unwrap_err();
        assert!(err.to_string().contains("unknown_command"));
        server.join().unwrap();
    }
}
