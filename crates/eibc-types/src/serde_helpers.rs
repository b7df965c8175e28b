//! Serde helpers for wire formats.

/// Amounts travel as decimal strings, the way Cosmos SDK encodes `math.Int`.
pub mod amount {
	use crate::common::Amount;
	use serde::{Deserialize, Deserializer, Serializer};

	pub fn serialize<S>(value: &Amount, serializer: S) -> Result<S::Ok, S::Error>
	where
		S: Serializer,
	{
		serializer.serialize_str(&value.to_string())
	}

	pub fn deserialize<'de, D>(deserializer: D) -> Result<Amount, D::Error>
	where
		D: Deserializer<'de>,
	{
		let raw = String::deserialize(deserializer)?;
		raw.parse::<Amount>()
			.map_err(|_| serde::de::Error::custom(format!("Invalid amount: {}", raw)))
	}
}

#[cfg(test)]
mod tests {
	use crate::common::Amount;
	use serde::{Deserialize, Serialize};

	#[derive(Debug, Serialize, Deserialize, PartialEq)]
	struct Coin {
		#[serde(with = "super::amount")]
		amount: Amount,
	}

	#[test]
	fn test_amount_is_a_string_on_the_wire() {
		let json = serde_json::to_string(&Coin { amount: 1_000_000 }).unwrap();
		assert_eq!(json, r#"{"amount":"1000000"}"#);

		let parsed: Coin = serde_json::from_str(r#"{"amount":"42"}"#).unwrap();
		assert_eq!(parsed.amount, 42);
	}

	#[test]
	fn test_amount_rejects_garbage() {
		assert!(serde_json::from_str::<Coin>(r#"{"amount":"-1"}"#).is_err());
		assert!(serde_json::from_str::<Coin>(r#"{"amount":"ten"}"#).is_err());
	}
}
