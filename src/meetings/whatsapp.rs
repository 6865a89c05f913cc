//! WhatsApp classes have no external meeting, only a click-to-chat link to the teacher.

use chrono::NaiveTime;

/// `https://wa.me/<digits>?text=...` for the teacher's phone, or None without one
pub fn click_to_chat_link(phone: Option<&str>, course_title: &str, start: NaiveTime) -> Option<String> {
    let digits: String = phone?.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }

    let message = format!(
        "Hello, I'm ready for our {} class scheduled at {}",
        course_title,
        start.format("%I:%M %p")
    );
    let mut url = reqwest::Url::parse(&format!("https://wa.me/{}", digits)).ok()?;
    url.query_pairs_mut().append_pair("text", &message);

    // form encoding writes spaces as '+'; wa.me expects %20
    Some(url.as_str().replace('+', "%20"))
}
