use sha2::{Digest, Sha256};

/// SHA256 字符编码后的长度
pub const SHA256_ENCODED_LEN: usize = 64;

/// 计算 sha256 摘要并编码为小写十六进制
pub fn sha256_hex(data: &str) -> String {
    let digest = Sha256::digest(data.as_bytes());
    let mut out = String::with_capacity(SHA256_ENCODED_LEN);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// 检查 task id 是否有效
pub fn check_task_id(id: &str) -> bool {
    id.len() == SHA256_ENCODED_LEN && id.chars().all(|c| c.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_hex() {
        // echo -n "abc" | sha256sum
        assert_eq!(
            sha256_hex("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_check_task_id() {
        assert!(check_task_id(&sha256_hex("x")));
        assert!(!check_task_id("abc"));
        assert!(!check_task_id(&"g".repeat(SHA256_ENCODED_LEN)));
    }
}
