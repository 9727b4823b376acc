mod frequency_limiter;

pub use frequency_limiter::PollFrequencyLimiter;
