pub mod comma_separated {
    use serde::de::Deserializer;
    use serde::Deserialize;

    /// Accepts either a TOML list or a `"a,b,c"` string (the environment
    /// variable form), trimming entries and dropping empties.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            List(Vec<String>),
            Csv(String),
        }

        let entries = match Repr::deserialize(deserializer)? {
            Repr::List(list) => list,
            Repr::Csv(csv) => csv.split(',').map(str::to_string).collect(),
        };
        Ok(entries
            .into_iter()
            .map(|entry| entry.trim().to_string())
            .filter(|entry| !entry.is_empty())
            .collect())
    }
}
