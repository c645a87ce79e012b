//! Prompt text for the extraction model.

pub const SYSTEM_PROMPT: &str =
    "You are a data extraction assistant. Output ONLY valid JSON. If a value is not found, use null.";

const CATEGORIES_SLOT: &str = "{categories}";
const CAPTION_SLOT: &str = "{caption}";

const ENRICH_TEMPLATE: &str = r#"Extract details from this Instagram caption about a student event.

EXAMPLE INPUT:
"PORSENI 2025!
Lomba IT: Web Design, UI/UX.
Lomba Umum: Baca Puisi, Matematika, Fisika, Adzan, dan Pidato."

EXAMPLE OUTPUT:
{
  "post_category": "COMPETITION",
  "comp_category": ["Web Development", "UI/UX Design", "Non-IT Competition", "Science Olympiad", "Religious Competition"],
  "organizer": null,
  "target_audience": ["Umum"],
  "min_team_size": 1,
  "max_team_size": 1,
  "registration_fee": 0
}

KNOWN CATEGORIES:
{categories}

RULES:
1. post_category: one of "COMPETITION", "WEBINAR", "GIVEAWAY", "OTHER".
   Use "COMPETITION" when the caption mentions "lomba" or "kompetisi".
   Use "OTHER" for anything that is not a competition, webinar or giveaway (promos, bootcamps).
2. comp_category: null when post_category is "GIVEAWAY" or "OTHER"; otherwise a list.
   Reuse a KNOWN CATEGORY name exactly whenever one fits.
   Math/Science -> "Science Olympiad". Religious (Adzan, MTQ) -> "Religious Competition".
   General arts/sports -> "Non-IT Competition".
3. organizer: the main university or company only. Ignore "BEM" and "Himpunan".
4. target_audience: a list drawn from ["SD", "SMP", "SMA", "Mahasiswa", "Umum"].
   "Siswa"/"SMK" -> "SMA". "Professional"/"Publik" -> "Umum". Use "Umum" when unsure.
5. min_team_size, max_team_size: integers or null.
6. registration_fee: integer, 0 when free.

CAPTION:
"{caption}"

Reply with exactly these keys:
post_category, comp_category, organizer, target_audience, min_team_size, max_team_size, registration_fee"#;

const REPAIR_TEMPLATE: &str = r#"Extract info from this caption.

KNOWN CATEGORIES:
{categories}

RULES:
1. post_category: one of "COMPETITION", "WEBINAR", "GIVEAWAY", "OTHER".
2. comp_category: null when post_category is "GIVEAWAY" or "OTHER".
   Match a KNOWN CATEGORY when possible. Math/Science -> "Science Olympiad",
   Religious -> "Religious Competition", Art/Speech -> "Non-IT Competition".
3. organizer: the main university or company only. Ignore "BEM" and "Himpunan".
4. target_audience: a list drawn from ["SD", "SMP", "SMA", "Mahasiswa", "Umum"].
   "Siswa", "Pelajar", "SMK", "SLTA", "Sederajat" -> "SMA".
   All ages, general public or professionals -> "Umum".
5. min_team_size, max_team_size: integer or null.
6. registration_fee: the registration fee only, never a prize amount.
   A list of integers when there are several registration batches, [0] when free.
   Amounts keep their number ("$10" -> 10, "Rp 50.000" -> 50000).

CAPTION:
"{caption}"

Reply with exactly these keys:
post_category, comp_category, organizer, target_audience, min_team_size, max_team_size, registration_fee"#;

/// Which prompt a pass uses. Repair asks more pointed questions about fees
/// and audience synonyms than the first pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptVariant {
    Enrich,
    Repair,
}

impl PromptVariant {
    fn template(&self) -> &'static str {
        match self {
            PromptVariant::Enrich => ENRICH_TEMPLATE,
            PromptVariant::Repair => REPAIR_TEMPLATE,
        }
    }

    /// Fill the template. The caption is spliced in last so text inside it
    /// is never treated as a slot.
    pub fn render(&self, categories: &str, caption: &str) -> String {
        let template = self.template();
        match template.split_once(CAPTION_SLOT) {
            Some((head, tail)) => format!(
                "{}{}{}",
                head.replace(CATEGORIES_SLOT, categories),
                caption,
                tail.replace(CATEGORIES_SLOT, categories)
            ),
            None => template.replace(CATEGORIES_SLOT, categories),
        }
    }
}
