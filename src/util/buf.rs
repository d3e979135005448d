use anyhow::bail;
use bytes::{Buf, BufMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};

pub fn put_string(buf: &mut impl BufMut, s: &str) {
    buf.put_usize_varint(s.len());
    buf.put_slice(s.as_bytes());
}

pub fn try_get_string(buf: &mut impl Buf) -> anyhow::Result<String> {
    let len = buf.try_get_usize_varint()?;
    if len > buf.remaining() {
        bail!("string length {} exceeds remaining buffer of {} bytes", len, buf.remaining());
    }

    let mut result = vec![0u8; len];
    buf.copy_to_slice(&mut result);

    let s = String::from_utf8(result)?;
    Ok(s)
}

#[cfg(test)]
mod tests {
    use bytes::{Buf, BytesMut};
    use rstest::rstest;
    use crate::util::buf::{put_string, try_get_string};

    #[rstest]
    #[case::empty("", vec![0])]
    #[case::a("a", vec![1,97])]
    #[case::abc("abc", vec![3,97,98,99])]
    #[case::umlaut("ä", vec![2,0xc3,0xa4])]
    #[case::heart("❤️", vec![6, 226,157,164,239,184,143])]
    fn test_put_string(#[case] s: &str, #[case] expected: Vec<u8>) {
        let mut buf = BytesMut::new();
        put_string(&mut buf, s);
        assert_eq!(&buf, &expected);

        let mut deser_buf: &[u8] = &buf;
        let deser = try_get_string(&mut deser_buf).unwrap();
        assert!(deser_buf.is_empty());
        assert_eq!(&deser, s);
    }

    #[test]
    fn test_put_string_long_length_prefix() {
        let s = "x".repeat(300);
        let mut buf = BytesMut::new();
        put_string(&mut buf, &s);
        assert_eq!(&buf[..2], &[0xac, 0x02]);
        assert_eq!(buf.len(), 302);
    }

    #[test]
    fn test_try_get_string_remaining() {
        let mut deser_buf: &[u8] = b"\x01abc";
        let actual = try_get_string(&mut deser_buf).unwrap();
        assert_eq!(&actual, "a");
        assert_eq!(deser_buf.chunk(), b"bc");
    }

    #[test]
    fn test_try_get_string_too_short() {
        let mut deser_buf: &[u8] = b"\x02a";
        assert!(try_get_string(&mut deser_buf).is_err());
    }

    #[test]
    fn test_try_get_string_not_unicode() {
        let mut deser_buf: &[u8] = b"\x02\xc0\xaf";
        assert!(try_get_string(&mut deser_buf).is_err());
    }
}
