use num_derive::{FromPrimitive, ToPrimitive};
use strum_macros::AsRefStr;

// Max packet payload length; payloads of exactly this size continue in a
// follow-up packet with the same command and the next sequence number.
pub const MAX_PAYLOAD_LEN: usize = 16_777_215;

pub const PACKET_HEADER_LEN: usize = 4;

/// auth-plugin-data-part-1: the first 8 bytes of the scramble sent in the
/// initial handshake.
pub const AUTH_PLUGIN_DATA_PART_1_LENGTH: usize = 8;

/// Full scramble length (part-1 + part-2).
pub const SCRAMBLE_SIZE: usize = 20;

/// Statement id offset inside COM_STMT_EXECUTE / CLOSE / RESET /
/// SEND_LONG_DATA payloads (right after the command byte).
pub const STMT_ID_OFFSET: usize = 1;

#[derive(Debug, PartialEq, AsRefStr)]
pub enum AuthPluginName {
    #[strum(serialize = "mysql_old_password")]
    AuthMySQlOldPassword,
    #[strum(serialize = "caching_sha2_password")]
    AuthCachingSha2Password,
    #[strum(serialize = "sha256_password")]
    AuthSha256Password,
    #[strum(serialize = "mysql_native_password")]
    AuthNativePassword,
    #[strum(serialize = "auth_unknown_plugin")]
    UnKnowPluginName,
}

#[derive(Debug, PartialEq, ToPrimitive, FromPrimitive)]
#[repr(u8)]
pub enum HeaderInfo {
    OKHeader = 0x00,
    LocalInFileHeader = 0xfb,
    EOFHeader = 0xfe,
    ErrHeader = 0xff,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash, FromPrimitive, ToPrimitive)]
#[repr(u8)]
pub enum CommandCode {
    ComSleep = 0,
    ComQuit,
    ComInitDB,
    ComQuery,
    ComFieldList,
    ComCreateDB,
    ComDropDB,
    ComRefresh,
    ComShutdown,
    ComStatistics,
    ComProcessInfo,
    ComConnect,
    ComProcessKill,
    ComDebug,
    ComPing,
    ComTime,
    ComDelayedInsert,
    ComChangeUser,
    ComBinlogDump,
    ComTableDump,
    ComConnectOut,
    ComRegisterSlave,
    ComStmtPrepare,
    ComStmtExecute,
    ComStmtSendLongData,
    ComStmtClose,
    ComStmtReset,
    ComSetOption,
    ComStmtFetch,
    ComDaemon,
    ComBinlogDumpGtid,
    ComResetConnection,
    ComEnd,
}

impl CommandCode {
    /// Commands whose effect outlives the request/response cycle. They are
    /// appended to the session history before being routed so that a later
    /// backend can be caught up by replay.
    pub fn is_session_command(&self) -> bool {
        matches!(
            self,
            CommandCode::ComInitDB
                | CommandCode::ComChangeUser
                | CommandCode::ComSetOption
                | CommandCode::ComStmtPrepare
                | CommandCode::ComStmtClose
                | CommandCode::ComResetConnection
        )
    }

    /// Commands that produce no reply packet at all.
    pub fn is_fire_and_forget(&self) -> bool {
        matches!(
            self,
            CommandCode::ComStmtSendLongData | CommandCode::ComStmtClose | CommandCode::ComQuit
        )
    }

    /// Commands that carry a statement id right after the command byte and
    /// need the proxy-to-backend id rewrite before forwarding.
    pub fn carries_stmt_id(&self) -> bool {
        matches!(
            self,
            CommandCode::ComStmtExecute
                | CommandCode::ComStmtSendLongData
                | CommandCode::ComStmtClose
                | CommandCode::ComStmtReset
                | CommandCode::ComStmtFetch
        )
    }
}

#[cfg(test)]
mod test {
    use crate::protocol::mariadb::constants::*;
    use num_traits::FromPrimitive;

    #[test]
    pub fn max_packet_size_test() {
        let max_u24_size = 16_777_215;
        assert_eq!(max_u24_size, MAX_PAYLOAD_LEN);
    }

    #[test]
    pub fn test_command_code_round_trip() {
        assert_eq!(CommandCode::from_u8(3), Some(CommandCode::ComQuery));
        assert_eq!(
            CommandCode::from_u8(31),
            Some(CommandCode::ComResetConnection)
        );
        assert_eq!(CommandCode::from_u8(0xfe), None);
    }

    #[test]
    pub fn test_session_commands() {
        assert!(CommandCode::ComInitDB.is_session_command());
        assert!(CommandCode::ComSetOption.is_session_command());
        assert!(!CommandCode::ComQuery.is_session_command());
        assert!(CommandCode::ComStmtSendLongData.is_fire_and_forget());
        assert!(CommandCode::ComStmtExecute.carries_stmt_id());
    }
}
