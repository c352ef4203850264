use unicode_segmentation::UnicodeSegmentation;

use crate::models::Locale;

// Case is kept for slot values; patterns match case-insensitively.
pub fn normalize_text(input: &str, max_chars: usize) -> String {
    let cleaned = input
        .chars()
        .map(|ch| match ch {
            ',' | ';' | '!' | '?' => ' ',
            other => other,
        })
        .collect::<String>();

    let mut normalized = cleaned.split_whitespace().collect::<Vec<_>>().join(" ");
    while normalized.ends_with('.') {
        normalized.pop();
    }
    let normalized = normalized.trim_end();

    match normalized.char_indices().nth(max_chars) {
        Some((cut, _)) => normalized[..cut].trim_end().to_string(),
        None => normalized.to_string(),
    }
}

pub fn detect_locale(text: &str) -> Locale {
    let mut hebrew = 0usize;
    let mut arabic = 0usize;
    let mut cyrillic = 0usize;
    let mut latin = 0usize;
    let mut spanish_marks = 0usize;
    let mut french_marks = 0usize;

    for word in text.unicode_words() {
        let Some(first) = word.chars().next() else {
            continue;
        };
        match first as u32 {
            0x0590..=0x05FF => hebrew += 1,
            0x0600..=0x06FF => arabic += 1,
            0x0400..=0x04FF => cyrillic += 1,
            _ if first.is_alphabetic() => {
                latin += 1;
                if word.chars().any(|ch| matches!(ch, 'ñ' | 'á' | 'í' | 'ó' | 'ú')) {
                    spanish_marks += 1;
                }
                if word.chars().any(|ch| matches!(ch, 'ç' | 'è' | 'ê' | 'à' | 'ù')) {
                    french_marks += 1;
                }
            }
            _ => {}
        }
    }

    let best_other = hebrew.max(arabic).max(cyrillic);
    if best_other > latin {
        if best_other == hebrew {
            Locale::He
        } else if best_other == arabic {
            Locale::Ar
        } else {
            Locale::Ru
        }
    } else if latin == 0 {
        Locale::Unknown
    } else if spanish_marks > french_marks {
        Locale::Es
    } else if french_marks > 0 {
        Locale::Fr
    } else {
        Locale::En
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collapses_whitespace_and_punctuation() {
        assert_eq!(
            normalize_text("  note   john,  medication!! ", 256),
            "note john medication"
        );
        assert_eq!(normalize_text("open chart...", 256), "open chart");
    }

    #[test]
    fn keeps_time_separators_and_case() {
        assert_eq!(
            normalize_text("Schedule Appointment for Ada at 3:30pm.", 256),
            "Schedule Appointment for Ada at 3:30pm"
        );
    }

    #[test]
    fn truncates_on_char_boundary() {
        let text = "שלום ".repeat(100);
        let normalized = normalize_text(&text, 12);
        assert!(normalized.chars().count() <= 12);
    }

    #[test]
    fn detects_scripts() {
        assert_eq!(detect_locale("note john medication"), Locale::En);
        assert_eq!(detect_locale("רשום הערה ליוחנן"), Locale::He);
        assert_eq!(detect_locale("записать пациента"), Locale::Ru);
        assert_eq!(detect_locale("añadir nota médica"), Locale::Es);
        assert_eq!(detect_locale("12 34"), Locale::Unknown);
    }
}
