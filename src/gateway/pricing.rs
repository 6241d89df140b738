//! Token prices for the models the tutor talks to, in nanodollars
//! (1e-9 USD) per token.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelPricing {
    pub input_nanos_per_token: i64,
    pub output_nanos_per_token: i64,
}

impl ModelPricing {
    const fn per_million(input_usd_cents: i64, output_usd_cents: i64) -> Self {
        // 1 cent per 1M tokens = 10 nanodollars per token
        Self {
            input_nanos_per_token: input_usd_cents * 10,
            output_nanos_per_token: output_usd_cents * 10,
        }
    }

    pub fn cost(&self, input_tokens: u32, output_tokens: u32) -> i64 {
        i64::from(input_tokens) * self.input_nanos_per_token
            + i64::from(output_tokens) * self.output_nanos_per_token
    }
}

/// Charged for chat models missing from [`pricing_for`].
const UNLISTED_CHAT: ModelPricing = ModelPricing::per_million(100, 500);

/// Price of `model`. A router prefix (`openai/gpt-4o-mini`) and a dated
/// snapshot suffix (`gpt-4o-mini-2024-07-18`) are ignored.
pub fn pricing_for(model: &str) -> Option<ModelPricing> {
    let bare = model.rsplit('/').next().unwrap_or(model);
    let pricing = match strip_snapshot(bare) {
        "text-embedding-3-small" => ModelPricing::per_million(2, 0),
        "text-embedding-3-large" => ModelPricing::per_million(13, 0),
        "gpt-4o-mini" => ModelPricing::per_million(15, 60),
        "gpt-4o" => ModelPricing::per_million(250, 1_000),
        "gpt-4.1-mini" => ModelPricing::per_million(40, 160),
        "gpt-4.1" => ModelPricing::per_million(200, 800),
        _ => return None,
    };
    Some(pricing)
}

/// `gpt-4o-mini-2024-07-18` -> `gpt-4o-mini`.
fn strip_snapshot(model: &str) -> &str {
    let parts: Vec<&str> = model.rsplitn(4, '-').collect();
    let is_date = parts.len() == 4
        && parts[0].len() == 2
        && parts[1].len() == 2
        && parts[2].len() == 4
        && parts[..3].iter().all(|p| p.bytes().all(|b| b.is_ascii_digit()));
    if is_date {
        parts[3]
    } else {
        model
    }
}

pub fn chat_cost(model: &str, input_tokens: u32, output_tokens: u32) -> i64 {
    pricing_for(model)
        .unwrap_or(UNLISTED_CHAT)
        .cost(input_tokens, output_tokens)
}

/// Unlisted embedding models cost nothing.
pub fn embedding_cost(model: &str, tokens: u32) -> i64 {
    pricing_for(model).map_or(0, |p| p.cost(tokens, 0))
}
