//! Shared pagination request/response shapes for the HTTP control surface.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct PageRequest {
    #[serde(default = "default_page")]
    pub page: u32,
    #[serde(default = "default_size")]
    pub size: u32,
}

fn default_page() -> u32 {
    1
}

fn default_size() -> u32 {
    20
}

impl PageRequest {
    pub fn offset(&self) -> i64 {
        ((self.page.max(1) - 1) as i64) * self.size.max(1) as i64
    }

    pub fn limit(&self) -> i64 {
        self.size.max(1) as i64
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: i64,
    pub page: u32,
    pub size: u32,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, total: i64, request: PageRequest) -> Self {
        Self {
            items,
            total,
            page: request.page.max(1),
            size: request.size.max(1),
        }
    }
}
