//! Gateway identity helpers.
//!
//! The Network Server identifies a gateway by an EUI-64 derived from the
//! 6-byte hardware MAC address: the upper and lower halves of the MAC are
//! kept and `FF FE` is inserted in the middle, following the usual
//! MAC-48 to EUI-64 expansion.

use crate::error::GatewayError;

/// Expand a 6-byte MAC address into the 8-byte gateway EUI.
pub fn eui64_from_mac(mac: &[u8; 6]) -> [u8; 8] {
    [
        mac[0], mac[1], mac[2], 0xFF, 0xFE, mac[3], mac[4], mac[5],
    ]
}

/// ASCII-hex (upper case, 16 chars) form of the gateway EUI, used as the
/// configured gateway identity token.
pub fn gateway_id_token(mac: &[u8; 6]) -> String {
    hex::encode_upper(eui64_from_mac(mac))
}

/// Parse a 16-char ASCII-hex gateway token back into the 8-byte EUI.
pub fn parse_gateway_token(token: &str) -> Result<[u8; 8], GatewayError> {
    if token.len() != 16 {
        return Err(GatewayError::Settings(format!(
            "gateway id token must be 16 hex chars, got {}",
            token.len()
        )));
    }
    let bytes = hex::decode(token)
        .map_err(|e| GatewayError::Settings(format!("invalid gateway id token: {e}")))?;
    let mut eui = [0u8; 8];
    eui.copy_from_slice(&bytes);
    Ok(eui)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mac_expansion_inserts_fffe() {
        let mac = [0x24, 0x0A, 0xC4, 0x11, 0x22, 0x33];
        assert_eq!(
            eui64_from_mac(&mac),
            [0x24, 0x0A, 0xC4, 0xFF, 0xFE, 0x11, 0x22, 0x33]
        );
        assert_eq!(gateway_id_token(&mac), "240AC4FFFE112233");
    }

    #[test]
    fn token_round_trip() {
        let mac = [1, 2, 3, 4, 5, 6];
        let token = gateway_id_token(&mac);
        assert_eq!(parse_gateway_token(&token).unwrap(), eui64_from_mac(&mac));
        assert!(parse_gateway_token("123").is_err());
        assert!(parse_gateway_token("ZZ0AC4FFFE112233").is_err());
    }
}
