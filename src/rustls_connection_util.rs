use std::io::Cursor;

/// Hand as much of `data` to the connection's record reader as it will take.
///
/// rustls only buffers about one maximum-size record of unprocessed input, so
/// callers feeding several records alternate this with
/// `process_new_packets()` until everything is consumed. Returns the number
/// of bytes consumed, which is never zero for non-empty `data`.
#[inline]
pub fn feed_rustls_connection(
    connection: &mut rustls::Connection,
    data: &[u8],
) -> std::io::Result<usize> {
    let mut cursor = Cursor::new(data);
    let mut fed = 0;
    while fed < data.len() {
        let n = match connection.read_tls(&mut cursor) {
            Ok(n) => n,
            // Buffer full: hand back what was taken so far.
            Err(_) if fed > 0 => break,
            Err(e) => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("failed to feed rustls connection: {e}"),
                ));
            }
        };
        if n == 0 {
            break;
        }
        fed += n;
    }

    if fed == 0 && !data.is_empty() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!(
                "rustls connection did not consume any of {} bytes",
                data.len()
            ),
        ));
    }
    Ok(fed)
}

/// Move every queued outbound TLS byte into `out`. Returns the number of
/// bytes appended.
#[inline]
pub fn drain_rustls_connection(
    connection: &mut rustls::Connection,
    out: &mut Vec<u8>,
) -> std::io::Result<usize> {
    let start = out.len();
    while connection.wants_write() {
        if connection.write_tls(out)? == 0 {
            break;
        }
    }
    Ok(out.len() - start)
}
