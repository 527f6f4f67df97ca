use hashbrown::HashMap;
use std::sync::OnceLock;

pub const UTF8_GENERAL_CI: u8 = 33;
pub const UTF8_MB4_GENERAL_CI: u8 = 45;
pub const BINARY: u8 = 63;

/// Collation advertised in the initial handshake.
pub const DEFAULT_COLLATION_ID: u8 = UTF8_GENERAL_CI;

pub fn collation_names() -> &'static HashMap<&'static str, u8> {
    static COLLATIONS: OnceLock<HashMap<&'static str, u8>> = OnceLock::new();
    COLLATIONS.get_or_init(|| {
        HashMap::from_iter([
            ("big5_chinese_ci", 1_u8),
            ("latin1_swedish_ci", 8),
            ("latin2_general_ci", 9),
            ("ascii_general_ci", 11),
            ("ujis_japanese_ci", 12),
            ("sjis_japanese_ci", 13),
            ("latin1_danish_ci", 15),
            ("euckr_korean_ci", 19),
            ("gb2312_chinese_ci", 24),
            ("gbk_chinese_ci", 28),
            ("utf8_general_ci", UTF8_GENERAL_CI),
            ("binary", BINARY),
            ("utf8mb4_general_ci", UTF8_MB4_GENERAL_CI),
            ("utf8mb4_unicode_ci", 224),
            ("utf8mb4_0900_ai_ci", 255),
        ])
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn default_collation_is_utf8() {
        assert_eq!(
            *collation_names().get("utf8_general_ci").unwrap(),
            DEFAULT_COLLATION_ID
        );
    }
}
