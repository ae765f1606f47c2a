//! Year parsing for listing tables that mix western and Japanese-era years.

use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref ERA_YEAR: Regex = Regex::new(r"(\d+|元|一)\s*年").unwrap();
    static ref WESTERN_YEAR: Regex = Regex::new(r"^\s*(\d{4})").unwrap();
}

/// Era name and the western year of its first year.
const ERAS: [(&str, i32); 5] = [
    ("令和", 2019),
    ("平成", 1989),
    ("昭和", 1926),
    ("大正", 1912),
    ("明治", 1868),
];

/// Full-width digits and spaces to their ASCII forms.
pub fn normalize(text: &str) -> String {
    text.chars()
        .map(|c| match c {
            '０'..='９' => char::from_u32(c as u32 - '０' as u32 + '0' as u32).unwrap_or(c),
            '\u{3000}' => ' ',
            _ => c,
        })
        .collect()
}

/// `平成20年` → 2008, `令和元年` → 2019. `None` when no era is named.
pub fn era_to_western(text: &str) -> Option<i32> {
    let text = normalize(text);
    let (_, start) = ERAS.iter().find(|(name, _)| text.contains(name))?;
    let caps = ERA_YEAR.captures(&text)?;
    let era_year = match &caps[1] {
        "元" | "一" => 1,
        digits => digits.parse::<i32>().ok().filter(|y| *y >= 1)?,
    };
    start.checked_add(era_year - 1)
}

/// Western year from either notation, ignoring any parenthesised suffix.
pub fn parse_year(text: &str) -> Option<i32> {
    let head = text.split(['(', '（']).next().unwrap_or_default().trim();
    if let Some(year) = era_to_western(head) {
        return Some(year);
    }
    let head = normalize(head);
    WESTERN_YEAR.captures(&head)?[1].parse().ok()
}
