// Copyright 2026 Oxide Computer Company
