//! Heartbeat payload encoding
//!
//! A node advertises its cache peer urls by joining them with `|`, gzipping
//! the result and sending it as one datagram. Each payload must fit in a
//! single Ethernet frame, so long url lists are split until every piece does.

use std::io::{Read, Write};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use tracing::{debug, warn};

use cachemesh_common::{CacheMeshError, Result};

/// Maximum size of one heartbeat payload in bytes
pub const MTU: usize = 1500;

/// Separator between urls in an uncompressed payload
pub const URL_DELIMITER: char = '|';

/// Join urls with the delimiter and return the UTF-8 bytes.
///
/// Fails with [`CacheMeshError::Encoding`] if any url contains the delimiter.
pub fn assemble_url_list<S: AsRef<str>>(urls: &[S]) -> Result<Vec<u8>> {
    let mut assembled = String::new();
    for url in urls {
        let url = url.as_ref();
        if url.contains(URL_DELIMITER) {
            return Err(CacheMeshError::Encoding(url.to_string()));
        }
        if !assembled.is_empty() {
            assembled.push(URL_DELIMITER);
        }
        assembled.push_str(url);
    }
    debug!("Cache peers for this node to be advertised: {}", assembled);
    Ok(assembled.into_bytes())
}

/// Gzip a byte slice
pub fn gzip(ungzipped: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(ungzipped.len()), Compression::default());
    encoder.write_all(ungzipped)?;
    Ok(encoder.finish()?)
}

/// Gunzip a byte slice, failing with [`CacheMeshError::CorruptPayload`] on malformed input
pub fn ungzip(gzipped: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(gzipped);
    let mut ungzipped = Vec::with_capacity(gzipped.len() * 2);
    decoder
        .read_to_end(&mut ungzipped)
        .map_err(|e| CacheMeshError::CorruptPayload(e.to_string()))?;
    Ok(ungzipped)
}

/// Split the urls into compressed payloads of at most `max_size_per_payload` bytes.
///
/// The list is halved recursively until each half fits. A single url that
/// still does not fit is logged and dropped. Urls containing the delimiter
/// are skipped with a warning. An empty input yields no payloads.
pub fn create_compressed_payload<S: AsRef<str>>(
    urls: &[S],
    max_size_per_payload: usize,
) -> Vec<Vec<u8>> {
    let valid: Vec<&str> = urls
        .iter()
        .map(AsRef::as_ref)
        .filter(|url| {
            if url.contains(URL_DELIMITER) {
                warn!(
                    "Skipping peer url '{}': it contains the '{}' delimiter",
                    url, URL_DELIMITER
                );
                false
            } else {
                true
            }
        })
        .collect();

    let mut payloads = Vec::new();
    compress_into(&valid, max_size_per_payload, &mut payloads);
    payloads
}

fn compress_into(urls: &[&str], max_size_per_payload: usize, payloads: &mut Vec<Vec<u8>>) {
    if urls.is_empty() {
        return;
    }

    let compressed = match assemble_url_list(urls).and_then(|bytes| gzip(&bytes)) {
        Ok(compressed) => compressed,
        Err(e) => {
            warn!("Could not compress peer urls: {}", e);
            return;
        }
    };

    if compressed.len() <= max_size_per_payload {
        payloads.push(compressed);
        return;
    }

    if urls.len() == 1 {
        warn!(
            "Peer url '{}' is too long: its compressed size of {} bytes exceeds {} bytes. \
             It will not be advertised, shorten the cache name or host name",
            urls[0],
            compressed.len(),
            max_size_per_payload
        );
        return;
    }

    let half = urls.len() / 2;
    compress_into(&urls[..half], max_size_per_payload, payloads);
    compress_into(&urls[half..], max_size_per_payload, payloads);
}

/// Chunk the urls into groups of `maximum_peers_per_send` and compress each
/// group against [`MTU`], concatenating the results in order.
pub fn create_compressed_payload_list<S: AsRef<str>>(
    urls: &[S],
    maximum_peers_per_send: usize,
) -> Vec<Vec<u8>> {
    let chunk_size = maximum_peers_per_send.max(1);
    urls.chunks(chunk_size)
        .flat_map(|chunk| create_compressed_payload(chunk, MTU))
        .collect()
}

/// Decode a received payload back into its urls.
pub fn disassemble(payload: &[u8]) -> Result<Vec<String>> {
    let bytes = ungzip(payload)?;
    let text = String::from_utf8(bytes)
        .map_err(|e| CacheMeshError::CorruptPayload(format!("payload is not UTF-8: {}", e)))?;
    Ok(text
        .split(URL_DELIMITER)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect())
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use rand::Rng;

    use super::*;

    const RANDOM_CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0";

    fn peer_urls(count: usize) -> Vec<String> {
        (0..count)
            .map(|i| format!("tcp://localhost.localdomain:12000/Cache{}", i))
            .collect()
    }

    fn random_name(length: usize) -> String {
        let mut rng = rand::rng();
        (0..length)
            .map(|_| RANDOM_CHARS[rng.random_range(0..RANDOM_CHARS.len())] as char)
            .collect()
    }

    #[test]
    fn test_assemble_joins_with_delimiter() {
        let bytes = assemble_url_list(&["tcp://a:1/c1", "tcp://b:2/c2"]).unwrap();
        assert_eq!(bytes, b"tcp://a:1/c1|tcp://b:2/c2");
    }

    #[test]
    fn test_assemble_rejects_delimiter() {
        let result = assemble_url_list(&["tcp://a:1/c1", "tcp://b:2/bad|name"]);
        assert!(matches!(result, Err(CacheMeshError::Encoding(url)) if url == "tcp://b:2/bad|name"));
    }

    #[test]
    fn test_gzip_roundtrip() {
        let compressed = gzip(b"Test").unwrap();
        assert_eq!(ungzip(&compressed).unwrap(), b"Test");
    }

    #[test]
    fn test_gzip_random_bytes() {
        let mut data = vec![0u8; 3000];
        rand::rng().fill(&mut data[..]);
        let compressed = gzip(&data).unwrap();
        assert_eq!(ungzip(&compressed).unwrap(), data);
    }

    #[test]
    fn test_ungzip_corrupt_input() {
        let result = ungzip(b"definitely not gzip");
        assert!(matches!(result, Err(CacheMeshError::CorruptPayload(_))));
    }

    #[test]
    fn test_single_url_single_payload() {
        let payloads = create_compressed_payload(&["tcp://localhost:40001/sampleCache1"], MTU);
        assert_eq!(payloads.len(), 1);
        assert!(payloads[0].len() <= MTU);
    }

    #[test]
    fn test_empty_list_yields_no_payloads() {
        let urls: Vec<String> = Vec::new();
        assert!(create_compressed_payload(&urls, MTU).is_empty());
        assert!(create_compressed_payload_list(&urls, 500).is_empty());
    }

    #[test]
    fn test_max_peers_per_send_chunks_list() {
        let urls = peer_urls(10);
        let payloads = create_compressed_payload_list(&urls, 5);
        assert_eq!(payloads.len(), 2);

        let first = disassemble(&payloads[0]).unwrap();
        let second = disassemble(&payloads[1]).unwrap();
        assert_eq!(first, urls[..5]);
        assert_eq!(second, urls[5..]);
    }

    #[test]
    fn test_large_list_split_under_mtu() {
        let urls = peer_urls(999);
        let payloads = create_compressed_payload_list(&urls, 1000);

        assert!(payloads.len() >= 2);
        assert!(payloads.iter().all(|p| p.len() <= MTU));

        let decoded: HashSet<String> = payloads
            .iter()
            .flat_map(|p| disassemble(p).unwrap())
            .collect();
        let expected: HashSet<String> = urls.into_iter().collect();
        assert_eq!(decoded, expected);
    }

    #[test]
    fn test_oversized_single_url_dropped() {
        let url = format!("tcp://localhost:40001/{}", random_name(3000));
        let payloads = create_compressed_payload(&[url], MTU);
        assert!(payloads.is_empty());
    }

    #[test]
    fn test_oversized_url_does_not_block_others() {
        let urls = vec![
            "tcp://localhost:40001/small".to_string(),
            format!("tcp://localhost:40001/{}", random_name(3000)),
        ];
        let payloads = create_compressed_payload(&urls, MTU);

        assert_eq!(payloads.len(), 1);
        assert_eq!(disassemble(&payloads[0]).unwrap(), vec!["tcp://localhost:40001/small"]);
    }

    #[test]
    fn test_delimiter_url_skipped_when_chunking() {
        let payloads = create_compressed_payload(&["tcp://a:1/ok", "tcp://a:1/not|ok"], MTU);
        assert_eq!(payloads.len(), 1);
        assert_eq!(disassemble(&payloads[0]).unwrap(), vec!["tcp://a:1/ok"]);
    }

    #[test]
    fn test_disassemble_corrupt_payload() {
        assert!(matches!(
            disassemble(&[0x1f, 0x8b, 0x00]),
            Err(CacheMeshError::CorruptPayload(_))
        ));
    }
}
