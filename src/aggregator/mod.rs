pub mod daily_stat;
pub mod significance;
pub mod window;
pub mod window_aggregator;

pub use daily_stat::{DailyStat, DailyStatExtractor};
pub use significance::PriceTiers;
pub use window::Window;
pub use window_aggregator::{PriceMove, WindowAggregator};
