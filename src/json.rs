use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Serialize a [`SystemTime`] as absolute unix milliseconds.
///
/// Credential expiry must survive process restarts, so it is always stored
/// as an absolute point in time, never as a remaining duration.
pub mod unix_ms {
    use super::*;

    pub fn serialize<S>(time: &SystemTime, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let ms = time
            .duration_since(UNIX_EPOCH)
            .map_err(serde::ser::Error::custom)?
            .as_millis() as u64;
        serializer.serialize_u64(ms)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<SystemTime, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let ms: u64 = serde::Deserialize::deserialize(deserializer)?;
        Ok(UNIX_EPOCH + Duration::from_millis(ms))
    }
}

pub fn deserialize_duration_from_secs<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let secs: u64 = serde::Deserialize::deserialize(deserializer)?;
    Ok(Duration::from_secs(secs))
}

pub fn serialize_duration_to_secs<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_u64(duration.as_secs())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize)]
    struct Stamp {
        #[serde(with = "unix_ms")]
        at: SystemTime,
    }

    #[test]
    fn unix_ms_round_trips() {
        let at = UNIX_EPOCH + Duration::from_millis(1_700_000_000_123);
        let json = serde_json::to_string(&Stamp { at }).unwrap();
        assert_eq!(json, r#"{"at":1700000000123}"#);

        let back: Stamp = serde_json::from_str(&json).unwrap();
        assert_eq!(back.at, at);
    }
}
